//! Plugin command modules with hot reload
//!
//! A plugin is a TOML manifest in the plugin directory defining a derived
//! command: a new name over a built-in target with a parameter overlay.
//! Reloading re-reads the manifests and atomically replaces the registry
//! entries; in-flight invocations finish on the old definition. A watcher
//! debounces file-change notifications and can additionally request an agent
//! re-exec, which is the crash-safe path for plugins that outgrow aliasing.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agent::dispatcher::{
    CommandHandler, ConcurrencyClass, Dispatcher, HandlerError, HandlerOptions, HandlerOutput,
    HandlerResult,
};
use crate::agent::handlers::{is_builtin, RestartRequest};
use crate::domain_types::{CommandName, CommandTimeoutSecs};
use crate::error::ConfigError;
use crate::protocol::ErrorCode;

/// One plugin manifest (`<name>.toml` in the plugin directory)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Command name the plugin registers
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Built-in target command the alias dispatches to
    pub command: String,
    /// Parameter overlay merged under the caller's parameters
    #[serde(default)]
    pub params: toml::value::Table,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_capability: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_class: Option<ConcurrencyClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout_secs: Option<u64>,
}

/// Dispatches an alias to its target with merged parameters
struct AliasHandler {
    target: CommandName,
    overlay: Value,
    dispatcher: Weak<Dispatcher>,
}

#[async_trait::async_trait]
impl CommandHandler for AliasHandler {
    async fn invoke(&self, params: Value) -> HandlerResult {
        let Some(dispatcher) = self.dispatcher.upgrade() else {
            return Err(HandlerError::new(
                ErrorCode::Internal,
                "DispatcherGone",
                "dispatcher dropped while alias was live",
            ));
        };
        let merged = merge_params(&self.overlay, &params);
        // The alias already holds its class slot; a pooled dispatch here
        // could deadlock against itself
        let envelope = dispatcher
            .dispatch_reentrant(&self.target, Some(merged), None, None)
            .await;
        if envelope.success {
            let mut output = HandlerOutput::data(envelope.data.unwrap_or(Value::Null));
            output.message = envelope.message;
            Ok(output)
        } else {
            let error = envelope.error.unwrap_or_else(|| crate::protocol::ErrorInfo {
                message: "alias target failed".to_string(),
                error_type: "AliasTarget".to_string(),
                code: Some(ErrorCode::Internal),
                details: None,
            });
            Err(HandlerError {
                code: error.code.unwrap_or(ErrorCode::Internal),
                error_type: error.error_type,
                message: error.message,
                details: error.details,
            })
        }
    }
}

/// Caller parameters win over the manifest overlay, key by key
fn merge_params(overlay: &Value, params: &Value) -> Value {
    match (overlay, params) {
        (Value::Object(base), Value::Object(extra)) => {
            let mut merged = base.clone();
            for (key, value) in extra {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        (_, Value::Null) => overlay.clone(),
        _ => params.clone(),
    }
}

/// Scans, registers, reloads, and watches the plugin directory
pub struct PluginManager {
    dispatcher: Weak<Dispatcher>,
    dir: PathBuf,
    registered: Mutex<HashSet<CommandName>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl PluginManager {
    /// Creates a manager over a plugin directory
    #[must_use]
    pub fn new(dispatcher: Weak<Dispatcher>, dir: PathBuf) -> Self {
        Self {
            dispatcher,
            dir,
            registered: Mutex::new(HashSet::new()),
            watcher: Mutex::new(None),
        }
    }

    /// Re-reads every manifest and swaps the registry entries atomically
    ///
    /// Manifests that fail to parse are skipped with a warning; plugin names
    /// that disappeared from the directory are unregistered.
    ///
    /// # Errors
    ///
    /// Returns an error when the plugin directory cannot be read at all.
    pub fn reload_all(&self) -> Result<Vec<String>, ConfigError> {
        let Some(dispatcher) = self.dispatcher.upgrade() else {
            return Ok(Vec::new());
        };
        let entries = std::fs::read_dir(&self.dir).map_err(|source| ConfigError::Read {
            path: self.dir.display().to_string(),
            source,
        })?;

        let mut loaded = Vec::new();
        let mut seen: HashSet<CommandName> = HashSet::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            match self.load_manifest(&path, &dispatcher) {
                Ok(name) => {
                    loaded.push(name.to_string());
                    seen.insert(name);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping plugin manifest"),
            }
        }

        // Drop registrations whose manifest vanished
        let mut registered = self.registered.lock().unwrap();
        for stale in registered.difference(&seen).cloned().collect::<Vec<_>>() {
            dispatcher.unregister(&stale);
            info!(plugin = %stale, "plugin unregistered");
        }
        *registered = seen;

        loaded.sort();
        info!(count = loaded.len(), "plugin reload complete");
        Ok(loaded)
    }

    /// Reloads a single plugin by name (`<name>.toml`)
    ///
    /// # Errors
    ///
    /// Returns an error when the manifest is missing or invalid.
    pub fn reload_module(&self, name: &str) -> Result<String, ConfigError> {
        let Some(dispatcher) = self.dispatcher.upgrade() else {
            return Err(ConfigError::Validation {
                field: "dispatcher".to_string(),
                reason: "dispatcher dropped".to_string(),
            });
        };
        let path = self.dir.join(format!("{name}.toml"));
        let registered = self.load_manifest(&path, &dispatcher)?;
        self.registered.lock().unwrap().insert(registered.clone());
        Ok(registered.to_string())
    }

    fn load_manifest(
        &self,
        path: &Path,
        dispatcher: &Arc<Dispatcher>,
    ) -> Result<CommandName, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let manifest: PluginManifest = toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        if !is_builtin(&manifest.command) {
            return Err(ConfigError::Validation {
                field: "command".to_string(),
                reason: format!("{} is not a built-in target", manifest.command),
            });
        }
        let name = CommandName::try_new(manifest.name.clone()).map_err(|e| {
            ConfigError::Validation {
                field: "name".to_string(),
                reason: e.to_string(),
            }
        })?;
        if is_builtin(name.as_ref()) {
            return Err(ConfigError::Validation {
                field: "name".to_string(),
                reason: format!("{name} would shadow a built-in command"),
            });
        }
        let target = CommandName::try_new(manifest.command.clone()).map_err(|e| {
            ConfigError::Validation {
                field: "command".to_string(),
                reason: e.to_string(),
            }
        })?;

        let overlay = toml_table_to_json(&manifest.params);
        let concurrency_class = manifest
            .concurrency_class
            .or_else(|| dispatcher.class_of(&target));
        dispatcher.register(
            name.clone(),
            Arc::new(AliasHandler {
                target,
                overlay,
                dispatcher: self.dispatcher.clone(),
            }),
            HandlerOptions {
                required_capability: manifest.required_capability,
                // Default to the target's class so the alias slot is the
                // bound for the real work
                concurrency_class,
                default_timeout: manifest
                    .default_timeout_secs
                    .and_then(|secs| CommandTimeoutSecs::try_new(secs).ok()),
            },
        );
        debug!(plugin = %name, path = %path.display(), "plugin registered");
        Ok(name)
    }

    /// Starts watching the plugin directory with a debounce
    ///
    /// Change bursts settle for `debounce` before one reload fires; when a
    /// restart channel is given, the reload is followed by a re-exec request.
    ///
    /// # Errors
    ///
    /// Returns an error when the OS watch cannot be installed.
    pub fn spawn_watcher(
        self: &Arc<Self>,
        debounce: Duration,
        restart: Option<mpsc::Sender<RestartRequest>>,
    ) -> notify::Result<()> {
        let (tx, rx) = std::sync::mpsc::channel::<notify::Result<notify::Event>>();
        let mut watcher = notify::recommended_watcher(tx)?;
        watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;
        *self.watcher.lock().unwrap() = Some(watcher);

        let manager = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            while let Ok(event) = rx.recv() {
                if !is_mutation(&event) {
                    continue;
                }
                // Debounce: swallow the burst until it quiets down
                while rx.recv_timeout(debounce).is_ok() {}
                match manager.reload_all() {
                    Ok(loaded) => info!(count = loaded.len(), "plugins reloaded after change"),
                    Err(e) => warn!(error = %e, "plugin reload failed"),
                }
                if let Some(restart) = &restart {
                    let _ = restart.blocking_send(RestartRequest {
                        delay_secs: 1,
                        reason: "plugin directory changed".to_string(),
                    });
                }
            }
        });
        Ok(())
    }
}

fn is_mutation(event: &notify::Result<notify::Event>) -> bool {
    match event {
        Ok(event) => matches!(
            event.kind,
            notify::EventKind::Create(_)
                | notify::EventKind::Modify(_)
                | notify::EventKind::Remove(_)
        ),
        Err(_) => false,
    }
}

fn toml_table_to_json(table: &toml::value::Table) -> Value {
    let mut map = serde_json::Map::new();
    for (key, value) in table {
        map.insert(key.clone(), toml_value_to_json(value));
    }
    Value::Object(map)
}

fn toml_value_to_json(value: &toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s.clone()),
        toml::Value::Integer(i) => Value::from(*i),
        toml::Value::Float(f) => Value::from(*f),
        toml::Value::Boolean(b) => Value::Bool(*b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => {
            Value::Array(items.iter().map(toml_value_to_json).collect())
        }
        toml::Value::Table(table) => toml_table_to_json(table),
    }
}
