//! Broker integration tests over real WebSocket connections
//!
//! Covers registration, admin listing, forward/correlate, unknown targets,
//! protocol violations, and dead-target failure of pending correlations.

use std::time::Duration;

use deskpilot::broker::{BrokerConfig, BrokerServer};
use deskpilot::domain_types::{CommandName, ConnectionId};
use deskpilot::protocol::{
    AdminRequest, CapabilitySet, CommandSpec, ErrorCode, ForwardStatus, Frame, ResponseEnvelope,
    Role,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn start_broker() -> (String, BrokerServer) {
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
    (format!("ws://{addr}/ws"), server)
}

async fn connect(url: &str) -> WsStream {
    let (socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    socket
}

async fn send(socket: &mut WsStream, frame: &Frame) {
    socket
        .send(Message::text(frame.to_json().unwrap()))
        .await
        .unwrap();
}

async fn recv(socket: &mut WsStream) -> Frame {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match message {
            Message::Text(text) => return Frame::from_json(text.as_str()).unwrap(),
            Message::Close(_) => panic!("unexpected close"),
            _ => continue,
        }
    }
}

async fn register(socket: &mut WsStream, role: Role, session: &str) -> ConnectionId {
    let mut capabilities = CapabilitySet::new();
    capabilities.insert(
        match role {
            Role::Manager => "management",
            _ => "control",
        }
        .to_string(),
        true,
    );
    send(
        socket,
        &Frame::Register {
            role,
            user_session: session.to_string(),
            capabilities,
            client_start_time: None,
            system_info: None,
        },
    )
    .await;
    match recv(socket).await {
        Frame::Welcome { client_id, .. } => client_id,
        other => panic!("expected welcome, got {other:?}"),
    }
}

fn spec(name: &str) -> CommandSpec {
    CommandSpec::new(CommandName::try_new(name).unwrap(), Some(json!({})))
}

#[tokio::test]
async fn register_then_list_shows_every_connection() {
    let (url, _server) = start_broker().await;

    let mut agent = connect(&url).await;
    let agent_id = register(&mut agent, Role::Agent, "wjchk").await;

    let mut manager = connect(&url).await;
    let manager_id = register(&mut manager, Role::Manager, "operator").await;
    assert_ne!(agent_id, manager_id);

    send(
        &mut manager,
        &Frame::Request {
            command: AdminRequest::ListClients,
        },
    )
    .await;
    let Frame::ClientList { clients } = recv(&mut manager).await else {
        panic!("expected client list");
    };
    assert_eq!(clients.len(), 2);
    let sessions: Vec<&str> = clients.iter().map(|c| c.user_session.as_str()).collect();
    assert!(sessions.contains(&"wjchk"));
    assert!(sessions.contains(&"operator"));
    let agent_row = clients.iter().find(|c| c.id == agent_id).unwrap();
    assert!(agent_row.capabilities["control"]);
}

#[tokio::test]
async fn forward_and_correlate_round_trip() {
    let (url, _server) = start_broker().await;

    let mut agent = connect(&url).await;
    let agent_id = register(&mut agent, Role::Agent, "wjchk").await;

    let mut manager = connect(&url).await;
    register(&mut manager, Role::Manager, "operator").await;

    send(
        &mut manager,
        &Frame::ForwardCommand {
            target_client: agent_id,
            command: spec("get_windows").with_command_id("c1"),
            timeout_secs: None,
        },
    )
    .await;

    // Exactly one forward-ack with the correlation id
    let Frame::ForwardAck {
        status,
        correlation_id,
    } = recv(&mut manager).await
    else {
        panic!("expected forward ack");
    };
    assert_eq!(status, ForwardStatus::Queued);

    // The agent receives the relayed command and replies
    let Frame::Command {
        command,
        command_id,
        correlation_id: relayed,
        ..
    } = recv(&mut agent).await
    else {
        panic!("expected command");
    };
    assert_eq!(command.as_ref(), "get_windows");
    assert_eq!(command_id.as_deref(), Some("c1"));
    assert_eq!(relayed, correlation_id);

    send(
        &mut agent,
        &Frame::CommandResult {
            correlation_id: relayed,
            from_client: None,
            result: ResponseEnvelope::success(json!({"windows": []})),
        },
    )
    .await;

    // The manager receives it tagged with the agent's id
    let Frame::CommandResult {
        correlation_id: received,
        from_client,
        result,
    } = recv(&mut manager).await
    else {
        panic!("expected command result");
    };
    assert_eq!(received, correlation_id);
    assert_eq!(from_client, Some(agent_id));
    assert!(result.success);
    assert!(result.validate().is_ok());
}

#[tokio::test]
async fn forwarding_to_unknown_target_acks_no_such_target() {
    let (url, _server) = start_broker().await;
    let mut manager = connect(&url).await;
    register(&mut manager, Role::Manager, "operator").await;

    send(
        &mut manager,
        &Frame::ForwardCommand {
            target_client: ConnectionId::new(4096),
            command: spec("ping"),
            timeout_secs: None,
        },
    )
    .await;
    let Frame::ForwardAck { status, .. } = recv(&mut manager).await else {
        panic!("expected forward ack");
    };
    assert_eq!(status, ForwardStatus::NoSuchTarget);

    // And no TARGET_DEAD ever follows
    let silence =
        tokio::time::timeout(Duration::from_millis(300), async { recv(&mut manager).await })
            .await;
    assert!(silence.is_err(), "no late frame expected");
}

#[tokio::test]
async fn dead_target_fails_pending_correlation() {
    let (url, _server) = start_broker().await;

    let mut agent = connect(&url).await;
    let agent_id = register(&mut agent, Role::Agent, "wjchk").await;

    let mut manager = connect(&url).await;
    register(&mut manager, Role::Manager, "operator").await;

    send(
        &mut manager,
        &Frame::ForwardCommand {
            target_client: agent_id,
            command: spec("long_running"),
            timeout_secs: Some(60),
        },
    )
    .await;
    let Frame::ForwardAck {
        correlation_id,
        status,
    } = recv(&mut manager).await
    else {
        panic!("expected forward ack");
    };
    assert_eq!(status, ForwardStatus::Queued);

    // The agent vanishes before replying
    drop(agent);

    let Frame::CommandResult {
        correlation_id: received,
        result,
        ..
    } = recv(&mut manager).await
    else {
        panic!("expected command result");
    };
    assert_eq!(received, correlation_id);
    assert!(!result.success);
    assert_eq!(result.error.unwrap().code, Some(ErrorCode::TargetDead));
}

#[tokio::test]
async fn register_must_be_first() {
    let (url, _server) = start_broker().await;
    let mut socket = connect(&url).await;
    send(&mut socket, &Frame::Heartbeat { ts: None }).await;

    // The broker closes without a welcome
    let outcome = tokio::time::timeout(Duration::from_secs(5), socket.next()).await;
    match outcome {
        Ok(None) | Ok(Some(Ok(Message::Close(_)))) => {}
        Ok(Some(Ok(Message::Text(text)))) => {
            panic!("expected close, got frame {text}")
        }
        Ok(Some(_)) | Err(_) => {}
    }
}

#[tokio::test]
async fn ids_stay_unique_across_disconnects() {
    let (url, _server) = start_broker().await;
    let mut seen = std::collections::HashSet::new();
    for round in 0..5 {
        let mut socket = connect(&url).await;
        let id = register(&mut socket, Role::Agent, &format!("s{round}")).await;
        assert!(seen.insert(id), "id {id} reused");
        drop(socket);
        // Give the broker a beat to process the close
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn heartbeats_keep_the_connection_listed() {
    let (url, _server) = start_broker().await;
    let mut agent = connect(&url).await;
    let agent_id = register(&mut agent, Role::Agent, "wjchk").await;

    send(
        &mut agent,
        &Frame::Heartbeat {
            ts: Some(chrono::Utc::now()),
        },
    )
    .await;

    let mut manager = connect(&url).await;
    register(&mut manager, Role::Manager, "operator").await;
    send(
        &mut manager,
        &Frame::Request {
            command: AdminRequest::ListClients,
        },
    )
    .await;
    let Frame::ClientList { clients } = recv(&mut manager).await else {
        panic!("expected client list");
    };
    assert!(clients.iter().any(|c| c.id == agent_id));
}
