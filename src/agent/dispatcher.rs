//! Command dispatcher: handler registry, bounded concurrency, deadlines
//!
//! Handlers are looked up by name, gated on advertised capabilities, and run
//! inside their concurrency class — `gui_exclusive` is single-slot because
//! those handlers manipulate global desktop state. Whatever a handler does
//! (return, fail, panic, or overrun its deadline) comes back as a well-formed
//! response envelope. Replacing a registry entry is atomic and is the hot
//! reload primitive: in-flight invocations finish on the old handler, new
//! calls see the new one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::domain_types::{CommandName, CommandTimeoutSecs, PoolSize};
use crate::error::DispatchError;
use crate::protocol::{
    advertises, CapabilitySet, ErrorCode, ResponseEnvelope, ResponseMetadata,
};

/// Named worker pools bounding handler parallelism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyClass {
    /// Cheap reads: window enumeration, process lists, log queries
    IoLight,
    /// Desktop-state mutators; single slot, never overlapping
    GuiExclusive,
    /// Long blocking work: capture, OCR, program launch
    Blocking,
}

impl ConcurrencyClass {
    /// Default pool size for the class
    #[must_use]
    pub fn default_pool_size(&self) -> PoolSize {
        let size = match self {
            ConcurrencyClass::IoLight => 4,
            ConcurrencyClass::GuiExclusive => 1,
            ConcurrencyClass::Blocking => 2,
        };
        PoolSize::try_new(size).expect("class pool sizes are in range")
    }
}

/// What a successful handler hands back before envelope wrapping
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HandlerOutput {
    pub data: Value,
    pub message: Option<String>,
    /// Write-path attribution for send-text style handlers
    pub method: Option<String>,
}

impl HandlerOutput {
    /// Plain data output
    #[must_use]
    pub fn data(data: Value) -> Self {
        Self {
            data,
            message: None,
            method: None,
        }
    }

    /// Attaches an operator-facing message
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attaches write-path attribution
    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }
}

/// A handler failure, already categorized for the envelope
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerError {
    pub code: ErrorCode,
    pub error_type: String,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerError {
    /// Builds a failure with the given category
    #[must_use]
    pub fn new(code: ErrorCode, error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            error_type: error_type.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Parameter validation failure
    #[must_use]
    pub fn invalid_param(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParam, "InvalidParam", message)
    }

    /// Attaches structured detail
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<crate::error::GuiError> for HandlerError {
    fn from(error: crate::error::GuiError) -> Self {
        use crate::error::GuiError;
        let code = match &error {
            GuiError::InputNotApplied { .. } => ErrorCode::InputNotApplied,
            GuiError::WindowNotFound(_) | GuiError::NoInputCandidate { .. } => {
                ErrorCode::InvalidParam
            }
            GuiError::TreeUnavailable { .. }
            | GuiError::Clipboard { .. }
            | GuiError::Capture { .. }
            | GuiError::Ocr { .. }
            | GuiError::Os { .. }
            | GuiError::Launch { .. } => ErrorCode::OsError,
        };
        let error_type = match &error {
            GuiError::WindowNotFound(_) => "WindowNotFound",
            GuiError::NoInputCandidate { .. } => "NoInputCandidate",
            GuiError::InputNotApplied { .. } => "InputNotApplied",
            GuiError::TreeUnavailable { .. } => "TreeUnavailable",
            GuiError::Clipboard { .. } => "Clipboard",
            GuiError::Capture { .. } => "Capture",
            GuiError::Ocr { .. } => "Ocr",
            GuiError::Os { .. } => "Os",
            GuiError::Launch { .. } => "Launch",
        };
        Self::new(code, error_type, error.to_string())
    }
}

/// Result type every handler produces
pub type HandlerResult = Result<HandlerOutput, HandlerError>;

/// A dispatchable capability handler
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Runs the handler with its JSON parameters
    async fn invoke(&self, params: Value) -> HandlerResult;
}

/// Blanket adapter so closures returning futures can register directly
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = HandlerResult> + Send,
{
    async fn invoke(&self, params: Value) -> HandlerResult {
        (self.0)(params).await
    }
}

/// Registration options for one handler
#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    pub required_capability: Option<String>,
    pub default_timeout: Option<CommandTimeoutSecs>,
    pub concurrency_class: Option<ConcurrencyClass>,
}

struct HandlerEntry {
    handler: Arc<dyn CommandHandler>,
    required_capability: Option<String>,
    default_timeout: CommandTimeoutSecs,
    concurrency_class: ConcurrencyClass,
}

/// Metadata row returned by `list()`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_capability: Option<String>,
    pub default_timeout_secs: u64,
    pub concurrency_class: ConcurrencyClass,
}

/// The dispatcher
pub struct Dispatcher {
    entries: DashMap<CommandName, Arc<HandlerEntry>>,
    pools: HashMap<ConcurrencyClass, Arc<Semaphore>>,
    capabilities: CapabilitySet,
}

impl Dispatcher {
    /// Creates a dispatcher advertising the given capability set
    #[must_use]
    pub fn new(capabilities: CapabilitySet) -> Self {
        let mut pools = HashMap::new();
        for class in [
            ConcurrencyClass::IoLight,
            ConcurrencyClass::GuiExclusive,
            ConcurrencyClass::Blocking,
        ] {
            pools.insert(
                class,
                Arc::new(Semaphore::new(class.default_pool_size().as_usize())),
            );
        }
        Self {
            entries: DashMap::new(),
            pools,
            capabilities,
        }
    }

    /// Adds or atomically replaces a handler; replacement is hot reload
    pub fn register(
        &self,
        name: CommandName,
        handler: Arc<dyn CommandHandler>,
        options: HandlerOptions,
    ) {
        let entry = Arc::new(HandlerEntry {
            handler,
            required_capability: options.required_capability,
            default_timeout: options.default_timeout.unwrap_or_default(),
            concurrency_class: options
                .concurrency_class
                .unwrap_or(ConcurrencyClass::IoLight),
        });
        let replaced = self.entries.insert(name.clone(), entry).is_some();
        debug!(command = %name, replaced, "handler registered");
    }

    /// Removes a handler; true when something was removed
    pub fn unregister(&self, name: &CommandName) -> bool {
        self.entries.remove(name).is_some()
    }

    /// Registered handler metadata, sorted by name
    #[must_use]
    pub fn list(&self) -> Vec<HandlerInfo> {
        let mut infos: Vec<HandlerInfo> = self
            .entries
            .iter()
            .map(|entry| HandlerInfo {
                name: entry.key().to_string(),
                required_capability: entry.value().required_capability.clone(),
                default_timeout_secs: entry.value().default_timeout.as_u64(),
                concurrency_class: entry.value().concurrency_class,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// The capability set this agent advertises
    #[must_use]
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Concurrency class of a registered command, for queue routing
    #[must_use]
    pub fn class_of(&self, command: &CommandName) -> Option<ConcurrencyClass> {
        self.entries
            .get(command)
            .map(|entry| entry.value().concurrency_class)
    }

    /// Dispatches one command to its handler, returning the envelope
    pub async fn dispatch(
        &self,
        command: &CommandName,
        params: Option<Value>,
        command_id: Option<String>,
        timeout_override_secs: Option<u64>,
    ) -> ResponseEnvelope {
        self.dispatch_inner(command, params, command_id, timeout_override_secs, true)
            .await
    }

    /// Dispatch for handlers that re-enter the dispatcher
    ///
    /// Skips class-slot acquisition: the calling handler already holds a
    /// slot, and taking a second one from the same pool would deadlock.
    pub async fn dispatch_reentrant(
        &self,
        command: &CommandName,
        params: Option<Value>,
        command_id: Option<String>,
        timeout_override_secs: Option<u64>,
    ) -> ResponseEnvelope {
        self.dispatch_inner(command, params, command_id, timeout_override_secs, false)
            .await
    }

    async fn dispatch_inner(
        &self,
        command: &CommandName,
        params: Option<Value>,
        command_id: Option<String>,
        timeout_override_secs: Option<u64>,
        acquire_slot: bool,
    ) -> ResponseEnvelope {
        let started = Instant::now();

        let Some(entry) = self
            .entries
            .get(command)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return self.finish(
                command,
                command_id,
                params,
                started,
                None,
                Err(HandlerError::new(
                    ErrorCode::UnknownCommand,
                    "UnknownCommand",
                    DispatchError::UnknownCommand(command.clone()).to_string(),
                )),
            );
        };

        if let Some(capability) = &entry.required_capability {
            if !advertises(&self.capabilities, capability) {
                let error = DispatchError::CapabilityMissing {
                    command: command.clone(),
                    capability: capability.clone(),
                };
                return self.finish(
                    command,
                    command_id,
                    params,
                    started,
                    None,
                    Err(HandlerError::new(
                        ErrorCode::CapabilityMissing,
                        "CapabilityMissing",
                        error.to_string(),
                    )),
                );
            }
        }

        let permit = if acquire_slot {
            let pool = Arc::clone(&self.pools[&entry.concurrency_class]);
            Some(pool.acquire_owned().await.expect("pool never closed"))
        } else {
            None
        };

        let timeout_secs = timeout_override_secs.unwrap_or_else(|| entry.default_timeout.as_u64());
        let deadline = std::time::Duration::from_secs(timeout_secs);
        let handler = Arc::clone(&entry.handler);
        let handler_params = params.clone().unwrap_or(Value::Null);

        // Panics are isolated in their own task and normalized at the join
        let invocation = tokio::spawn(async move {
            let result = handler.invoke(handler_params).await;
            drop(permit);
            result
        });
        let abort = invocation.abort_handle();

        let result = match tokio::time::timeout(deadline, invocation).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                error!(command = %command, error = %join_error, "handler panicked");
                let detail = DispatchError::HandlerPanic {
                    detail: join_error.to_string(),
                };
                Err(HandlerError::new(
                    ErrorCode::Internal,
                    "HandlerPanic",
                    detail.to_string(),
                ))
            }
            Err(_) => {
                warn!(command = %command, timeout_secs, "handler deadline expired");
                // Cancellation is cooperative: the handler is dropped at its
                // next suspension point, releasing its class slot
                abort.abort();
                let detail = DispatchError::Timeout {
                    command: command.clone(),
                    timeout_secs,
                };
                Err(HandlerError::new(
                    ErrorCode::Timeout,
                    "Timeout",
                    detail.to_string(),
                ))
            }
        };

        let method = match &result {
            Ok(output) => output.method.clone(),
            Err(_) => None,
        };
        self.finish(command, command_id, params, started, method, result)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        command: &CommandName,
        command_id: Option<String>,
        params: Option<Value>,
        started: Instant,
        method: Option<String>,
        result: HandlerResult,
    ) -> ResponseEnvelope {
        let metadata = ResponseMetadata {
            command: command.to_string(),
            execution_time: started.elapsed().as_secs_f64(),
            command_id,
            params,
            method,
        };
        match result {
            Ok(output) => {
                let mut envelope = ResponseEnvelope::success(output.data);
                envelope.message = output.message;
                envelope.with_metadata(metadata)
            }
            Err(error) => {
                let mut envelope =
                    ResponseEnvelope::failure(error.code, error.error_type, error.message);
                if let Some(details) = error.details {
                    envelope = envelope.with_details(details);
                }
                envelope.with_metadata(metadata)
            }
        }
    }
}
