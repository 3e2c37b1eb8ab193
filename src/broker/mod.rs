//! The broker: registration, addressing, liveness, forwarding, correlation
//!
//! The broker accepts bidirectional WebSocket connections, assigns monotonic
//! connection ids, routes `forward_command` frames toward agents under each
//! target's send ordering, and correlates asynchronous replies back to the
//! originating manager. All per-connection failures are non-fatal; only bind
//! failure brings the process down.

pub mod config;
pub mod connection;
pub mod router;
pub mod server;

pub use config::{BrokerConfig, DEFAULT_PORT, PORT_ENV_VAR};
pub use connection::{ConnectionHandle, ConnectionRegistry, Registration};
pub use router::{CommandRouter, PendingCorrelation};
pub use server::{BrokerServer, BrokerState};
