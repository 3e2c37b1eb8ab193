//! WebSocket accept loop and per-connection tasks
//!
//! Each accepted socket must register before anything else. After the
//! welcome, the connection gets a reader task (inbound frames) and a writer
//! task draining its bounded outbound queue; a background sweep closes idle
//! connections and expires forwarding deadlines.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::{any, get},
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::config::BrokerConfig;
use crate::broker::connection::{ConnectionHandle, ConnectionRegistry, Registration};
use crate::broker::router::CommandRouter;
use crate::domain_types::ConnectionId;
use crate::error::{BrokerError, ProtocolError};
use crate::protocol::{AdminRequest, Frame};
use crate::time_provider::{production_time_provider, SharedTimeProvider};

/// Time allowed for the register frame to arrive after accept
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared broker state behind the axum handlers
pub struct BrokerState {
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<CommandRouter>,
    pub config: BrokerConfig,
    pub time: SharedTimeProvider,
    pub shutdown: CancellationToken,
}

/// The broker server: accept loop plus background liveness sweep
pub struct BrokerServer {
    state: Arc<BrokerState>,
}

impl BrokerServer {
    /// Creates a broker with the production clock
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_time_provider(config, production_time_provider())
    }

    /// Creates a broker with an injected clock
    #[must_use]
    pub fn with_time_provider(config: BrokerConfig, time: SharedTimeProvider) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(
            config.outbound_queue,
            Arc::clone(&time),
        ));
        let router = Arc::new(CommandRouter::new(
            Arc::clone(&registry),
            config.forward_timeout,
            Arc::clone(&time),
        ));
        Self {
            state: Arc::new(BrokerState {
                registry,
                router,
                config,
                time,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Shared state, for admin introspection and tests
    #[must_use]
    pub fn state(&self) -> Arc<BrokerState> {
        Arc::clone(&self.state)
    }

    /// Token cancelled to stop the broker
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Binds the configured listen address
    ///
    /// # Errors
    ///
    /// Bind failure is fatal for the broker process.
    pub async fn bind(&self) -> Result<TcpListener, BrokerError> {
        let addr = self.state.config.bind_addr();
        TcpListener::bind(&addr)
            .await
            .map_err(|source| BrokerError::Bind { addr, source })
    }

    /// Builds the axum router
    #[must_use]
    pub fn app(&self) -> Router {
        Router::new()
            .route("/", any(ws_handler))
            .route("/ws", any(ws_handler))
            .route("/health", get(|| async { "OK" }))
            .with_state(Arc::clone(&self.state))
    }

    /// Serves connections until the shutdown token fires
    ///
    /// # Errors
    ///
    /// Returns an error if the accept loop fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BrokerError> {
        let local = listener.local_addr()?;
        info!(addr = %local, "broker listening");

        self.spawn_liveness_sweep();

        let app = self.app();
        let shutdown = self.state.shutdown.clone();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| BrokerError::Io { source: e })?;

        info!("broker stopped");
        Ok(())
    }

    fn spawn_liveness_sweep(&self) {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let sweep = state.config.liveness_sweep.as_duration();
            let dead_after = state.config.dead_timeout.as_duration();
            loop {
                tokio::select! {
                    () = state.time.sleep(sweep) => {}
                    () = state.shutdown.cancelled() => break,
                }
                for id in state.registry.idle_connections(dead_after) {
                    warn!(connection = %id, "closing connection after heartbeat timeout");
                    close_connection(&state, id);
                }
                state.router.expire_deadlines();
            }
        });
    }
}

/// Removes a connection and fails whatever was waiting on it
pub fn close_connection(state: &BrokerState, id: ConnectionId) {
    if state.registry.remove(id).is_some() {
        state.router.fail_pending_for_target(id);
        state.router.drop_pending_for_manager(id);
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<BrokerState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, addr, state))
}

async fn handle_socket(socket: WebSocket, addr: SocketAddr, state: Arc<BrokerState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // The register frame must come first; anything else is a protocol error.
    let registration = match await_register(&mut ws_rx, addr).await {
        Ok(registration) => registration,
        Err(e) => {
            debug!(%addr, error = %e, "closing unregistered connection");
            let _ = ws_tx.close().await;
            return;
        }
    };

    let (handle, mut outbound_rx) = state.registry.register(registration);
    let id = handle.id;
    info!(
        connection = %id,
        role = %handle.role,
        session = %handle.user_session,
        %addr,
        "client registered"
    );

    let welcome = Frame::Welcome {
        client_id: id,
        server_time: state.time.now_utc(),
    };
    if state.registry.enqueue(id, welcome).is_err() {
        close_connection(&state, id);
        return;
    }

    // Writer task: the sole writer on this socket, draining the bounded queue
    let writer_shutdown = handle.shutdown.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = outbound_rx.recv() => {
                    let Some(frame) = frame else { break };
                    let text = match frame.to_json() {
                        Ok(text) => text,
                        Err(e) => {
                            error!(connection = %id, error = %e, "failed to serialize outbound frame");
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                () = writer_shutdown.cancelled() => break,
            }
        }
        let _ = ws_tx.close().await;
    });

    // Reader loop on this task
    let reader_shutdown = handle.shutdown.clone();
    loop {
        let message = tokio::select! {
            message = ws_rx.next() => message,
            () = reader_shutdown.cancelled() => break,
        };
        let Some(Ok(message)) = message else { break };
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            // Ping/pong are handled by the transport; binary frames are not
            // part of the protocol.
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Binary(_) => {
                warn!(connection = %id, "binary frame on text protocol, closing");
                break;
            }
        };
        match handle_frame(&state, &handle, text.as_str()) {
            Ok(()) => {}
            Err(e) => {
                warn!(connection = %id, error = %e, "protocol violation, closing");
                break;
            }
        }
    }

    close_connection(&state, id);
    writer.abort();
    info!(connection = %id, "client disconnected");
}

async fn await_register(
    ws_rx: &mut futures::stream::SplitStream<WebSocket>,
    addr: SocketAddr,
) -> Result<Registration, ProtocolError> {
    let message = tokio::time::timeout(REGISTER_TIMEOUT, ws_rx.next())
        .await
        .map_err(|_| ProtocolError::MalformedFrame {
            reason: "no register frame before timeout".to_string(),
        })?
        .and_then(Result::ok)
        .ok_or_else(|| ProtocolError::MalformedFrame {
            reason: "connection closed before register".to_string(),
        })?;

    let Message::Text(text) = message else {
        return Err(ProtocolError::MalformedFrame {
            reason: "non-text frame before register".to_string(),
        });
    };

    match Frame::from_json(text.as_str())? {
        Frame::Register {
            role,
            user_session,
            capabilities,
            client_start_time,
            ..
        } => Ok(Registration {
            role,
            user_session,
            capabilities,
            client_start_time,
            remote_addr: Some(addr.to_string()),
        }),
        other => Err(ProtocolError::RegisterNotFirst {
            frame_type: frame_type_name(&other).to_string(),
        }),
    }
}

fn handle_frame(
    state: &BrokerState,
    conn: &ConnectionHandle,
    text: &str,
) -> Result<(), ProtocolError> {
    let frame = Frame::from_json(text)?;
    conn.touch(state.time.now_utc());

    match frame {
        Frame::Heartbeat { .. } => Ok(()),
        Frame::Request {
            command: AdminRequest::ListClients,
        } => {
            let clients = state.registry.snapshot();
            let _ = state
                .registry
                .enqueue(conn.id, Frame::ClientList { clients });
            Ok(())
        }
        Frame::ForwardCommand {
            target_client,
            command,
            timeout_secs,
        } => {
            let ack = state
                .router
                .forward(conn.id, target_client, command, timeout_secs);
            let _ = state.registry.enqueue(conn.id, ack);
            Ok(())
        }
        Frame::CommandResult {
            correlation_id,
            result,
            ..
        } => {
            state.router.on_command_result(conn.id, correlation_id, result);
            Ok(())
        }
        Frame::Register { .. } => Err(ProtocolError::RegisterNotFirst {
            frame_type: "register".to_string(),
        }),
        other => Err(ProtocolError::MalformedFrame {
            reason: format!(
                "frame type {} is not valid client→broker",
                frame_type_name(&other)
            ),
        }),
    }
}

fn frame_type_name(frame: &Frame) -> &'static str {
    match frame {
        Frame::Register { .. } => "register",
        Frame::Welcome { .. } => "welcome",
        Frame::Heartbeat { .. } => "heartbeat",
        Frame::Request { .. } => "request",
        Frame::ClientList { .. } => "client_list",
        Frame::ForwardCommand { .. } => "forward_command",
        Frame::ForwardAck { .. } => "forward_ack",
        Frame::Command { .. } => "command",
        Frame::CommandResult { .. } => "command_result",
    }
}
