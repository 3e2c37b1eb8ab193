//! End-to-end: manager → broker → agent runtime → dispatcher → handlers
//!
//! Runs a real broker and a real agent runtime wired to the simulated
//! desktop, then drives it from a manager connection the way the operator
//! CLI would.

use std::sync::Arc;
use std::time::Duration;

use deskpilot::agent::{
    register_builtin_handlers, AgentConfig, AgentRuntime, Dispatcher, HandlerContext,
    HealthMonitor, LogManager,
};
use deskpilot::broker::{BrokerConfig, BrokerServer};
use deskpilot::domain_types::{CommandName, ConnectionId};
use deskpilot::gui::backend::{PlacementState, RawUiaNode, Rect, SimulatedDesktop, WindowRecord};
use deskpilot::gui::input::{SendTextConfig, SendTextEngine};
use deskpilot::gui::position_memory::PositionMemory;
use deskpilot::gui::{CaptureService, WindowManager};
use deskpilot::production_time_provider;
use deskpilot::protocol::{
    AdminRequest, CapabilitySet, CommandSpec, ErrorCode, ForwardStatus, Frame, ResponseEnvelope,
    Role,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn start_broker() -> String {
    let mut config = BrokerConfig::development();
    config.port = 0;
    let server = BrokerServer::new(config);
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = server.app();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
        )
        .await
        .unwrap();
    });
    format!("ws://{addr}/ws")
}

fn cursor_desktop() -> Arc<SimulatedDesktop> {
    let desktop = Arc::new(SimulatedDesktop::new());
    desktop.set_windows(vec![WindowRecord {
        hwnd: 7,
        title: "main.rs - Cursor".to_string(),
        class_name: "Chrome_WidgetWin_1".to_string(),
        process_id: 100,
        process_name: "Cursor.exe".to_string(),
        rect: Rect::new(0, 0, 1200, 900),
        visible: true,
        enabled: true,
        placement_state: PlacementState::Normal,
    }]);
    let mut tree = RawUiaNode {
        control_type: "Window".to_string(),
        name: "Cursor".to_string(),
        is_enabled: true,
        is_visible: true,
        rect: Rect::new(0, 0, 1200, 900),
        ..RawUiaNode::default()
    };
    tree.children.push(RawUiaNode {
        control_type: "Edit".to_string(),
        name: "Chat Input".to_string(),
        automation_id: "chat-box".to_string(),
        rect: Rect::new(350, 820, 850, 860),
        is_enabled: true,
        is_visible: true,
        is_keyboard_focusable: true,
        ..RawUiaNode::default()
    });
    desktop.set_tree(7, tree);
    desktop
}

fn spawn_agent(broker_url: &str, session: &str) -> Arc<SimulatedDesktop> {
    let desktop = cursor_desktop();
    let mut config = AgentConfig::development();
    config.broker_url = broker_url.to_string();
    config.user_session = session.to_string();
    config.position_memory_path = None;

    let time = production_time_provider();
    let windows = Arc::new(WindowManager::new(desktop.clone()));
    let memory = Arc::new(PositionMemory::new(Default::default(), Default::default()));
    let engine = Arc::new(SendTextEngine::new(
        Arc::clone(&windows),
        desktop.clone(),
        desktop.clone(),
        desktop.clone(),
        Arc::clone(&memory),
        Arc::clone(&time),
        SendTextConfig::default(),
    ));
    let capture = Arc::new(CaptureService::new(desktop.clone(), Arc::clone(&windows)));
    let logs = Arc::new(LogManager::new(Default::default()));
    let health = Arc::new(HealthMonitor::new(Default::default(), Default::default()));
    let (restart_tx, restart_rx) = mpsc::channel(4);

    let dispatcher = Arc::new(Dispatcher::new(config.capabilities.clone()));
    let ctx = Arc::new(HandlerContext {
        windows,
        tree: desktop.clone(),
        input: desktop.clone(),
        engine,
        capture,
        ocr: None,
        memory: Arc::clone(&memory),
        logs,
        health: Arc::clone(&health),
        restart: restart_tx,
    });
    register_builtin_handlers(&dispatcher, Arc::downgrade(&dispatcher), ctx);

    let runtime = AgentRuntime::new(config, dispatcher, health, memory, time);
    tokio::spawn(async move {
        runtime.run(restart_rx).await;
    });
    desktop
}

async fn connect_manager(url: &str) -> WsStream {
    let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let frame = Frame::Register {
        role: Role::Manager,
        user_session: "operator".to_string(),
        capabilities: CapabilitySet::new(),
        client_start_time: None,
        system_info: None,
    };
    socket
        .send(Message::text(frame.to_json().unwrap()))
        .await
        .unwrap();
    let Frame::Welcome { .. } = recv(&mut socket).await else {
        panic!("expected welcome");
    };
    socket
}

async fn recv(socket: &mut WsStream) -> Frame {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(10), socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match message {
            Message::Text(text) => return Frame::from_json(text.as_str()).unwrap(),
            _ => continue,
        }
    }
}

/// Polls `list_clients` until the agent session shows up
async fn find_agent(socket: &mut WsStream, session: &str) -> ConnectionId {
    for _ in 0..50 {
        socket
            .send(Message::text(
                Frame::Request {
                    command: AdminRequest::ListClients,
                }
                .to_json()
                .unwrap(),
            ))
            .await
            .unwrap();
        let Frame::ClientList { clients } = recv(socket).await else {
            continue;
        };
        if let Some(agent) = clients
            .iter()
            .find(|c| c.role == Role::Agent && c.user_session == session)
        {
            return agent.id;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("agent {session} never registered");
}

async fn run_command(
    socket: &mut WsStream,
    target: ConnectionId,
    name: &str,
    params: serde_json::Value,
) -> ResponseEnvelope {
    let frame = Frame::ForwardCommand {
        target_client: target,
        command: CommandSpec::new(CommandName::try_new(name).unwrap(), Some(params)),
        timeout_secs: Some(10),
    };
    socket
        .send(Message::text(frame.to_json().unwrap()))
        .await
        .unwrap();

    let correlation = loop {
        match recv(socket).await {
            Frame::ForwardAck {
                status: ForwardStatus::Queued,
                correlation_id,
            } => break correlation_id,
            Frame::ForwardAck { status, .. } => panic!("forward failed: {status:?}"),
            _ => continue,
        }
    };
    loop {
        match recv(socket).await {
            Frame::CommandResult {
                correlation_id,
                result,
                ..
            } if correlation_id == correlation => return result,
            _ => continue,
        }
    }
}

#[tokio::test]
async fn manager_drives_a_live_agent_end_to_end() {
    let url = start_broker().await;
    let desktop = spawn_agent(&url, "wjchk");
    let mut manager = connect_manager(&url).await;
    let agent_id = find_agent(&mut manager, "wjchk").await;

    // get_windows over the full path
    let envelope = run_command(&mut manager, agent_id, "get_windows", json!({})).await;
    assert!(envelope.success, "{:?}", envelope.error);
    assert!(envelope.validate().is_ok());
    let data = envelope.data.unwrap();
    assert_eq!(data["count"], 1);
    assert_eq!(data["windows"][0]["title"], "main.rs - Cursor");

    // send_text by intent, then read the focused value back
    let envelope = run_command(
        &mut manager,
        agent_id,
        "send_text",
        json!({"target": {"kind": "intent", "hwnd": 7}, "text": "hello\nworld"}),
    )
    .await;
    assert!(envelope.success, "{:?}", envelope.error);
    assert_eq!(
        envelope.metadata.as_ref().unwrap().method.as_deref(),
        Some("keystroke")
    );
    assert_eq!(desktop.focused_value(), "hello\nworld");

    let envelope = run_command(
        &mut manager,
        agent_id,
        "get_focused_value",
        json!({"hwnd": 7}),
    )
    .await;
    assert!(envelope.success);
    assert_eq!(envelope.data.unwrap()["value"], "hello\nworld");

    // Unknown commands come back as envelopes, not dropped frames
    let envelope = run_command(&mut manager, agent_id, "warp_reality", json!({})).await;
    assert!(!envelope.success);
    assert_eq!(
        envelope.error.unwrap().code,
        Some(ErrorCode::UnknownCommand)
    );
}
