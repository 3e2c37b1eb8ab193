//! deskpilot operator CLI
//!
//! One-shot management client: list connections, round-trip test an agent,
//! run a single command, or replay a batch file. Exit codes: 0 success,
//! 2 connect failure, 3 target missing, 4 command failed, 5 timeout.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use deskpilot::broker::{DEFAULT_PORT, PORT_ENV_VAR};
use deskpilot::domain_types::{CommandName, ConnectionId, CorrelationId};
use deskpilot::protocol::{
    AdminRequest, CapabilitySet, CommandSpec, ErrorCode, ForwardStatus, Frame, Role,
};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

const EXIT_OK: i32 = 0;
const EXIT_CONNECT: i32 = 2;
const EXIT_NO_TARGET: i32 = 3;
const EXIT_COMMAND_FAILED: i32 = 4;
const EXIT_TIMEOUT: i32 = 5;

/// Operator CLI for the deskpilot broker
#[derive(Debug, Parser)]
#[command(name = "deskpilot-cli", version, about)]
struct Args {
    /// Broker WebSocket URL
    #[arg(long)]
    url: Option<String>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Print live connections
    List,
    /// Send a trivial command and report the round trip
    Test {
        /// Target connection id
        client_id: u64,
    },
    /// Run one command on a target agent
    Command {
        /// Target connection id
        target: u64,
        /// Command name
        name: String,
        /// JSON parameters
        #[arg(long)]
        json: Option<String>,
        /// Deadline in seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// Run commands from a file (one `name [json-params]` per line)
    Batch {
        /// Target connection id
        target: u64,
        /// Batch file path
        file: PathBuf,
    },
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct Session {
    socket: WsStream,
}

impl Session {
    async fn connect(url: &str) -> Result<Self, String> {
        let (mut socket, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| format!("connect {url}: {e}"))?;

        let register = Frame::Register {
            role: Role::Manager,
            user_session: whoami(),
            capabilities: {
                let mut caps = CapabilitySet::new();
                caps.insert("management".to_string(), true);
                caps
            },
            client_start_time: Some(chrono::Utc::now()),
            system_info: None,
        };
        socket
            .send(Message::text(register.to_json().map_err(|e| e.to_string())?))
            .await
            .map_err(|e| e.to_string())?;

        match Self::next_frame(&mut socket, Duration::from_secs(10)).await? {
            Frame::Welcome { client_id, .. } => {
                eprintln!("connected as client {client_id}");
                Ok(Self { socket })
            }
            other => Err(format!("expected welcome, got {other:?}")),
        }
    }

    async fn next_frame(socket: &mut WsStream, deadline: Duration) -> Result<Frame, String> {
        loop {
            let message = tokio::time::timeout(deadline, socket.next())
                .await
                .map_err(|_| "timed out waiting for broker".to_string())?
                .ok_or("connection closed")?
                .map_err(|e| e.to_string())?;
            match message {
                Message::Text(text) => {
                    return Frame::from_json(text.as_str()).map_err(|e| e.to_string())
                }
                Message::Close(_) => return Err("connection closed".to_string()),
                _ => continue,
            }
        }
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), String> {
        self.socket
            .send(Message::text(frame.to_json().map_err(|e| e.to_string())?))
            .await
            .map_err(|e| e.to_string())
    }

    async fn list_clients(&mut self) -> Result<Vec<deskpilot::protocol::ClientSummary>, String> {
        self.send(&Frame::Request {
            command: AdminRequest::ListClients,
        })
        .await?;
        loop {
            match Self::next_frame(&mut self.socket, Duration::from_secs(10)).await? {
                Frame::ClientList { clients } => return Ok(clients),
                _ => continue,
            }
        }
    }

    /// Forwards one command and waits for its correlated result
    async fn run_command(
        &mut self,
        target: u64,
        name: &str,
        params: Option<serde_json::Value>,
        timeout_secs: u64,
    ) -> Result<i32, String> {
        let command = CommandName::try_new(name).map_err(|e| e.to_string())?;
        self.send(&Frame::ForwardCommand {
            target_client: ConnectionId::new(target),
            command: CommandSpec::new(command, params),
            timeout_secs: Some(timeout_secs),
        })
        .await?;

        let correlation = loop {
            match Self::next_frame(&mut self.socket, Duration::from_secs(10)).await? {
                Frame::ForwardAck {
                    status: ForwardStatus::NoSuchTarget,
                    ..
                } => {
                    eprintln!("no such target: {target}");
                    return Ok(EXIT_NO_TARGET);
                }
                Frame::ForwardAck {
                    status: ForwardStatus::Queued,
                    correlation_id,
                } => break correlation_id,
                _ => continue,
            }
        };

        let deadline = Duration::from_secs(timeout_secs + 5);
        match self.await_result(correlation, deadline).await {
            Ok(envelope) => {
                println!("{}", serde_json::to_string_pretty(&envelope).unwrap_or_default());
                if envelope.success {
                    Ok(EXIT_OK)
                } else if envelope
                    .error
                    .as_ref()
                    .and_then(|e| e.code)
                    .map_or(false, |code| {
                        code == ErrorCode::Timeout || code == ErrorCode::TargetDead
                    })
                {
                    Ok(EXIT_TIMEOUT)
                } else {
                    Ok(EXIT_COMMAND_FAILED)
                }
            }
            Err(e) => {
                eprintln!("{e}");
                Ok(EXIT_TIMEOUT)
            }
        }
    }

    async fn await_result(
        &mut self,
        correlation: CorrelationId,
        deadline: Duration,
    ) -> Result<deskpilot::protocol::ResponseEnvelope, String> {
        loop {
            match Self::next_frame(&mut self.socket, deadline).await? {
                Frame::CommandResult {
                    correlation_id,
                    result,
                    ..
                } if correlation_id == correlation => return Ok(result),
                _ => continue,
            }
        }
    }
}

fn whoami() -> String {
    std::env::var("USERNAME")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "operator".to_string())
}

fn default_url() -> String {
    let port = std::env::var(PORT_ENV_VAR)
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);
    format!("ws://127.0.0.1:{port}/ws")
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let url = args.url.clone().unwrap_or_else(default_url);
    std::process::exit(run(&url, args.command).await);
}

async fn run(url: &str, command: CliCommand) -> i32 {
    let mut session = match Session::connect(url).await {
        Ok(session) => session,
        Err(e) => {
            eprintln!("{e}");
            return EXIT_CONNECT;
        }
    };

    match command {
        CliCommand::List => match session.list_clients().await {
            Ok(clients) => {
                println!("{:>5}  {:8}  {:20}  {:25}  capabilities", "id", "role", "session", "last heartbeat");
                for client in clients {
                    let caps: Vec<&str> = client
                        .capabilities
                        .iter()
                        .filter(|(_, on)| **on)
                        .map(|(name, _)| name.as_str())
                        .collect();
                    println!(
                        "{:>5}  {:8}  {:20}  {:25}  {}",
                        client.id,
                        client.role.to_string(),
                        client.user_session,
                        client.last_heartbeat.to_rfc3339(),
                        caps.join(",")
                    );
                }
                EXIT_OK
            }
            Err(e) => {
                eprintln!("{e}");
                EXIT_CONNECT
            }
        },
        CliCommand::Test { client_id } => {
            let started = std::time::Instant::now();
            match session.run_command(client_id, "ping", None, 10).await {
                Ok(EXIT_OK) => {
                    println!("round trip: {:?}", started.elapsed());
                    EXIT_OK
                }
                Ok(code) => code,
                Err(e) => {
                    eprintln!("{e}");
                    EXIT_CONNECT
                }
            }
        }
        CliCommand::Command {
            target,
            name,
            json,
            timeout,
        } => {
            let params = match json.map(|j| serde_json::from_str(&j)).transpose() {
                Ok(params) => params,
                Err(e) => {
                    eprintln!("invalid --json: {e}");
                    return EXIT_COMMAND_FAILED;
                }
            };
            match session.run_command(target, &name, params, timeout).await {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("{e}");
                    EXIT_CONNECT
                }
            }
        }
        CliCommand::Batch { target, file } => {
            let text = match std::fs::read_to_string(&file) {
                Ok(text) => text,
                Err(e) => {
                    eprintln!("read {}: {e}", file.display());
                    return EXIT_COMMAND_FAILED;
                }
            };
            for (index, line) in text.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let (name, params) = match line.split_once(' ') {
                    Some((name, rest)) => match serde_json::from_str(rest.trim()) {
                        Ok(params) => (name, Some(params)),
                        Err(e) => {
                            eprintln!("line {}: invalid params: {e}", index + 1);
                            return EXIT_COMMAND_FAILED;
                        }
                    },
                    None => (line, None),
                };
                eprintln!("[{}] {name}", index + 1);
                match session.run_command(target, name, params, 30).await {
                    Ok(EXIT_OK) => {}
                    Ok(code) => return code,
                    Err(e) => {
                        eprintln!("{e}");
                        return EXIT_CONNECT;
                    }
                }
            }
            EXIT_OK
        }
    }
}
