//! # deskpilot - Remote Desktop Automation Platform
//!
//! deskpilot is a remote desktop automation and orchestration platform. A
//! central broker mediates between privileged management clients and agents
//! running inside end-user desktop sessions; agents expose a capability
//! surface (window enumeration, accessibility-tree extraction, synthetic
//! input with validation, screenshot and OCR, process listing, program
//! launch) so a manager can drive a remote GUI as if it were local.
//!
//! ## Components
//!
//! - **Broker** ([`broker`]): WebSocket accept loop, monotonic connection
//!   ids, heartbeat liveness, command forwarding with reply correlation.
//! - **Agent runtime** ([`agent`]): single-instance guard, reconnecting
//!   broker link, command dispatcher with bounded concurrency classes and
//!   hot-reloadable plugins, health monitor, log ring buffer, watchdog.
//! - **GUI-automation core** ([`gui`]): the capability handlers' machinery -
//!   window discovery, UIA tree walks with stable addressing, the send-text
//!   state machine with post-write validation, element scoring with adaptive
//!   position memory, capture and OCR handoff.
//!
//! All OS access goes through trait seams in [`gui::backend`]; the portable
//! core is exercised against a scripted desktop, with Win32/UIA backends in
//! [`platform`] for production agents.

pub mod agent;
pub mod broker;
pub mod domain_types;
pub mod error;
pub mod gui;
pub mod platform;
pub mod protocol;
pub mod time_provider;

pub use crate::agent::{AgentConfig, AgentRuntime, Dispatcher};
pub use crate::broker::{BrokerConfig, BrokerServer};
pub use crate::domain_types::{CommandName, ConnectionId, CorrelationId};
pub use crate::error::{AgentError, BrokerError, DispatchError, GuiError, ProtocolError};
pub use crate::protocol::{ErrorCode, Frame, ResponseEnvelope, Role};
pub use crate::time_provider::{production_time_provider, SharedTimeProvider, TimeProvider};
