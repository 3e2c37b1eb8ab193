//! Agent connection runtime
//!
//! Owns the connection state machine
//! `DISCONNECTED → CONNECTING → REGISTERING → LIVE`, heartbeats, reconnect
//! backoff with jitter, and the pump that feeds inbound commands into
//! per-class worker queues so invocations start in arrival order within a
//! class while classes proceed independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::config::AgentConfig;
use crate::agent::dispatcher::{ConcurrencyClass, Dispatcher};
use crate::agent::handlers::RestartRequest;
use crate::agent::health::HealthMonitor;
use crate::domain_types::{ConnectionId, CorrelationId};
use crate::error::AgentError;
use crate::gui::position_memory::PositionMemory;
use crate::protocol::{ErrorCode, Frame, ResponseEnvelope, Role};
use crate::time_provider::SharedTimeProvider;

/// Time allowed for the broker's welcome after register
const WELCOME_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection lifecycle states
///
/// Heartbeats and command dispatch only happen in `Live`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Registering,
    Live,
    Shutdown,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Registering,
            3 => ConnectionState::Live,
            4 => ConnectionState::Shutdown,
            _ => ConnectionState::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Registering => 2,
            ConnectionState::Live => 3,
            ConnectionState::Shutdown => 4,
        }
    }
}

/// How the runtime finished
#[derive(Debug, Clone, PartialEq)]
pub enum AgentExit {
    /// Orderly shutdown; the watchdog should not respawn
    Shutdown,
    /// Re-exec requested (hot reload or operator restart)
    Restart(RestartRequest),
}

enum SessionEnd {
    Disconnected { error: AgentError, was_live: bool },
    Restart(RestartRequest),
    Shutdown,
}

/// The agent runtime
pub struct AgentRuntime {
    config: AgentConfig,
    dispatcher: Arc<Dispatcher>,
    health: Arc<HealthMonitor>,
    memory: Arc<PositionMemory>,
    time: SharedTimeProvider,
    shutdown: CancellationToken,
    state: std::sync::atomic::AtomicU8,
}

impl AgentRuntime {
    /// Creates the runtime over pre-built services
    #[must_use]
    pub fn new(
        config: AgentConfig,
        dispatcher: Arc<Dispatcher>,
        health: Arc<HealthMonitor>,
        memory: Arc<PositionMemory>,
        time: SharedTimeProvider,
    ) -> Self {
        Self {
            config,
            dispatcher,
            health,
            memory,
            time,
            shutdown: CancellationToken::new(),
            state: std::sync::atomic::AtomicU8::new(ConnectionState::Disconnected.as_u8()),
        }
    }

    /// Token cancelled to stop the runtime
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(std::sync::atomic::Ordering::Relaxed))
    }

    fn enter(&self, state: ConnectionState) {
        self.state
            .store(state.as_u8(), std::sync::atomic::Ordering::Relaxed);
    }

    /// Runs until shutdown or a restart request
    ///
    /// Reconnects with exponential backoff (doubling from the initial delay
    /// to the cap, ±jitter) after any connection failure; the backoff resets
    /// once a session reaches LIVE.
    pub async fn run(&self, mut restart_rx: mpsc::Receiver<RestartRequest>) -> AgentExit {
        self.spawn_health_sampler();
        self.spawn_snapshot_loop();

        let mut failed_attempts: u32 = 0;
        loop {
            if self.shutdown.is_cancelled() {
                return self.finish(AgentExit::Shutdown);
            }

            match self.run_session(&mut restart_rx).await {
                SessionEnd::Shutdown => return self.finish(AgentExit::Shutdown),
                SessionEnd::Restart(request) => {
                    info!(reason = %request.reason, "restart requested");
                    return self.finish(AgentExit::Restart(request));
                }
                SessionEnd::Disconnected { error, was_live } => {
                    warn!(error = %error, "session ended, reconnecting");
                    if was_live {
                        failed_attempts = 0;
                    }
                    failed_attempts = failed_attempts.saturating_add(1);
                    let delay = self.backoff_delay(failed_attempts);
                    debug!(?delay, attempt = failed_attempts, "reconnect backoff");
                    tokio::select! {
                        () = self.time.sleep(delay) => {}
                        () = self.shutdown.cancelled() => return self.finish(AgentExit::Shutdown),
                        request = restart_rx.recv() => {
                            if let Some(request) = request {
                                return self.finish(AgentExit::Restart(request));
                            }
                        }
                    }
                }
            }
        }
    }

    fn finish(&self, exit: AgentExit) -> AgentExit {
        self.enter(ConnectionState::Shutdown);
        if let Some(path) = &self.config.position_memory_path {
            if let Err(e) = self.memory.snapshot(path) {
                warn!(error = %e, "final position-memory snapshot failed");
            }
        }
        exit
    }

    /// One connect → register → LIVE session
    async fn run_session(&self, restart_rx: &mut mpsc::Receiver<RestartRequest>) -> SessionEnd {
        self.enter(ConnectionState::Connecting);
        debug!(url = %self.config.broker_url, "connecting");
        let (socket, _response) = match connect_async(self.config.broker_url.as_str()).await {
            Ok(connection) => connection,
            Err(e) => {
                self.enter(ConnectionState::Disconnected);
                return SessionEnd::Disconnected {
                    error: AgentError::WebSocket {
                        reason: e.to_string(),
                    },
                    was_live: false,
                };
            }
        };
        let (mut ws_tx, mut ws_rx) = socket.split();

        self.enter(ConnectionState::Registering);
        let register = Frame::Register {
            role: Role::Agent,
            user_session: self.config.user_session.clone(),
            capabilities: self.dispatcher.capabilities().clone(),
            client_start_time: Some(self.time.now_utc()),
            system_info: None,
        };
        let register_text = match register.to_json() {
            Ok(text) => text,
            Err(e) => {
                self.enter(ConnectionState::Disconnected);
                return SessionEnd::Disconnected {
                    error: AgentError::Protocol(e),
                    was_live: false,
                };
            }
        };
        if let Err(e) = ws_tx.send(Message::text(register_text)).await {
            self.enter(ConnectionState::Disconnected);
            return SessionEnd::Disconnected {
                error: AgentError::WebSocket {
                    reason: e.to_string(),
                },
                was_live: false,
            };
        }

        let client_id = match await_welcome(&mut ws_rx).await {
            Ok(client_id) => client_id,
            Err(e) => {
                self.enter(ConnectionState::Disconnected);
                return SessionEnd::Disconnected {
                    error: e,
                    was_live: false,
                };
            }
        };
        self.enter(ConnectionState::Live);
        info!(%client_id, session = %self.config.user_session, "registered with broker");

        // LIVE: writer drains the bounded outbound queue; one heartbeat
        // timer; per-class worker queues start invocations in arrival order
        let (outbound_tx, mut outbound_rx) =
            mpsc::channel::<Frame>(self.config.outbound_queue.as_usize());
        let session_done = CancellationToken::new();

        let health = Arc::clone(&self.health);
        let writer_done = session_done.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = outbound_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let is_heartbeat = matches!(frame, Frame::Heartbeat { .. });
                        let text = match frame.to_json() {
                            Ok(text) => text,
                            Err(e) => {
                                error!(error = %e, "dropping unserializable frame");
                                continue;
                            }
                        };
                        let started = std::time::Instant::now();
                        if ws_tx.send(Message::text(text)).await.is_err() {
                            break;
                        }
                        if is_heartbeat {
                            health.record_heartbeat_latency(started.elapsed());
                        }
                    }
                    () = writer_done.cancelled() => break,
                }
            }
            let _ = ws_tx.close().await;
        });

        let heartbeat_tx = outbound_tx.clone();
        let heartbeat_interval = self.config.heartbeat.as_duration();
        let heartbeat_time = Arc::clone(&self.time);
        let heartbeat_done = session_done.clone();
        let heartbeat = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = heartbeat_time.sleep(heartbeat_interval) => {}
                    () = heartbeat_done.cancelled() => break,
                }
                let frame = Frame::Heartbeat {
                    ts: Some(heartbeat_time.now_utc()),
                };
                if heartbeat_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let workers = self.spawn_class_workers(&outbound_tx, &session_done);

        // Reader loop on this task
        let end = loop {
            tokio::select! {
                message = ws_rx.next() => {
                    let Some(Ok(message)) = message else {
                        break SessionEnd::Disconnected {
                            error: AgentError::ConnectionLost {
                                reason: "broker closed the connection".to_string(),
                            },
                            was_live: true,
                        };
                    };
                    let text = match message {
                        Message::Text(text) => text,
                        Message::Close(_) => {
                            break SessionEnd::Disconnected {
                                error: AgentError::ConnectionLost {
                                    reason: "broker sent close".to_string(),
                                },
                                was_live: true,
                            };
                        }
                        _ => continue,
                    };
                    match Frame::from_json(text.as_str()) {
                        Ok(Frame::Command { command, params, command_id, correlation_id, timeout_secs }) => {
                            let class = self
                                .dispatcher
                                .class_of(&command)
                                .unwrap_or(ConcurrencyClass::IoLight);
                            let work = CommandWork {
                                command: command.clone(),
                                params,
                                command_id,
                                correlation_id,
                                timeout_secs,
                            };
                            if workers[&class].send(work).await.is_err() {
                                break SessionEnd::Disconnected {
                                    error: AgentError::ConnectionLost {
                                        reason: "worker queue closed".to_string(),
                                    },
                                    was_live: true,
                                };
                            }
                        }
                        Ok(other) => {
                            debug!(frame = ?other, "ignoring non-command frame");
                        }
                        Err(e) => {
                            warn!(error = %e, "dropping malformed inbound frame");
                        }
                    }
                }
                request = restart_rx.recv() => {
                    if let Some(request) = request {
                        break SessionEnd::Restart(request);
                    }
                }
                () = self.shutdown.cancelled() => break SessionEnd::Shutdown,
            }
        };

        session_done.cancel();
        heartbeat.abort();
        writer.abort();
        self.enter(ConnectionState::Disconnected);
        end
    }

    /// Spawns the per-class worker pools for one session
    fn spawn_class_workers(
        &self,
        outbound: &mpsc::Sender<Frame>,
        session_done: &CancellationToken,
    ) -> HashMap<ConcurrencyClass, mpsc::Sender<CommandWork>> {
        let mut queues = HashMap::new();
        for class in [
            ConcurrencyClass::IoLight,
            ConcurrencyClass::GuiExclusive,
            ConcurrencyClass::Blocking,
        ] {
            let pool_size = class.default_pool_size().as_usize();
            let (tx, rx) = mpsc::channel::<CommandWork>(self.config.outbound_queue.as_usize());
            let rx = Arc::new(tokio::sync::Mutex::new(rx));
            for _ in 0..pool_size {
                let rx = Arc::clone(&rx);
                let dispatcher = Arc::clone(&self.dispatcher);
                let health = Arc::clone(&self.health);
                let outbound = outbound.clone();
                let done = session_done.clone();
                tokio::spawn(async move {
                    loop {
                        let work = {
                            let mut rx = rx.lock().await;
                            tokio::select! {
                                work = rx.recv() => work,
                                () = done.cancelled() => None,
                            }
                        };
                        let Some(work) = work else { break };
                        let started = std::time::Instant::now();
                        let envelope = dispatcher
                            .dispatch(
                                &work.command,
                                work.params,
                                work.command_id,
                                work.timeout_secs,
                            )
                            .await;
                        record_outcome(&health, &envelope, started.elapsed());
                        let frame = Frame::CommandResult {
                            correlation_id: work.correlation_id,
                            from_client: None,
                            result: envelope,
                        };
                        if outbound.send(frame).await.is_err() {
                            break;
                        }
                    }
                });
            }
            queues.insert(class, tx);
        }
        queues
    }

    fn spawn_health_sampler(&self) {
        let health = Arc::clone(&self.health);
        let time = Arc::clone(&self.time);
        let done = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = time.sleep(health.sample_interval()) => {}
                    () = done.cancelled() => break,
                }
                let health = Arc::clone(&health);
                let _ = tokio::task::spawn_blocking(move || health.sample()).await;
            }
        });
    }

    fn spawn_snapshot_loop(&self) {
        let Some(path) = self.config.position_memory_path.clone() else {
            return;
        };
        let memory = Arc::clone(&self.memory);
        let time = Arc::clone(&self.time);
        let interval = self.config.snapshot_interval.as_duration();
        let done = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = time.sleep(interval) => {}
                    () = done.cancelled() => break,
                }
                if let Err(e) = memory.snapshot(&path) {
                    warn!(error = %e, "position-memory snapshot failed");
                }
            }
        });
    }

    /// Exponential backoff with jitter: `initial * 2^(attempt-1)` capped,
    /// then ±jitter ratio
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let initial = self.config.backoff_initial.as_duration();
        let cap = self.config.backoff_cap.as_duration();
        let exponent = attempt.saturating_sub(1).min(16);
        let base = initial.saturating_mul(2_u32.saturating_pow(exponent)).min(cap);
        apply_jitter(base, self.config.backoff_jitter.as_f64())
    }
}

#[derive(Debug)]
struct CommandWork {
    command: crate::domain_types::CommandName,
    params: Option<serde_json::Value>,
    command_id: Option<String>,
    correlation_id: CorrelationId,
    timeout_secs: Option<u64>,
}

fn record_outcome(health: &HealthMonitor, envelope: &ResponseEnvelope, elapsed: Duration) {
    let timed_out = envelope
        .error
        .as_ref()
        .is_some_and(|e| e.code == Some(ErrorCode::Timeout));
    health.record_command(envelope.success, timed_out, elapsed);
}

fn apply_jitter(base: Duration, ratio: f64) -> Duration {
    if ratio <= 0.0 {
        return base;
    }
    let jitter = rand::thread_rng().gen_range(-ratio..=ratio);
    base.mul_f64((1.0 + jitter).max(0.0))
}

async fn await_welcome<S>(
    ws_rx: &mut futures::stream::SplitStream<S>,
) -> Result<ConnectionId, AgentError>
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let message = tokio::time::timeout(WELCOME_TIMEOUT, ws_rx.next())
        .await
        .map_err(|_| AgentError::RegistrationRejected {
            reason: "no welcome before timeout".to_string(),
        })?
        .and_then(Result::ok)
        .ok_or_else(|| AgentError::RegistrationRejected {
            reason: "connection closed during registration".to_string(),
        })?;

    let Message::Text(text) = message else {
        return Err(AgentError::RegistrationRejected {
            reason: "non-text frame during registration".to_string(),
        });
    };
    match Frame::from_json(text.as_str())? {
        Frame::Welcome { client_id, .. } => Ok(client_id),
        other => Err(AgentError::RegistrationRejected {
            reason: format!("expected welcome, got {other:?}"),
        }),
    }
}
