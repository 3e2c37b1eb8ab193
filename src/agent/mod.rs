//! The agent runtime
//!
//! A per-session client holding the broker connection, the single-instance
//! guard, the command dispatcher with its concurrency classes and hot-
//! reloadable plugin registry, the health monitor, and the log ring buffer.

pub mod config;
pub mod dispatcher;
pub mod handlers;
pub mod health;
pub mod log_buffer;
pub mod plugins;
pub mod runtime;
pub mod single_instance;
pub mod watchdog;

pub use config::AgentConfig;
pub use dispatcher::{
    CommandHandler, ConcurrencyClass, Dispatcher, FnHandler, HandlerError, HandlerInfo,
    HandlerOptions, HandlerOutput, HandlerResult,
};
pub use handlers::{register_builtin_handlers, HandlerContext, RestartRequest};
pub use health::{HealthMonitor, HealthReport, HealthState};
pub use log_buffer::{
    LogLevel, LogManager, LogQuery, LogRecord, RingBufferLayer, RotatingFileSink,
};
pub use plugins::{PluginManager, PluginManifest};
pub use runtime::{AgentExit, AgentRuntime, ConnectionState};
pub use single_instance::SingleInstanceGuard;
pub use watchdog::{run_watchdog, RestartBudgetTracker, RESTART_EXIT_CODE};
