//! Agent configuration
//!
//! Covers the broker endpoint, heartbeat and reconnect tuning, the GUI input
//! tunables, plugin directory, health thresholds' sampling geometry, and the
//! position-memory snapshot. Presets mirror the broker config style.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::broker::config::{DEFAULT_PORT, PORT_ENV_VAR};
use crate::domain_types::{
    BackoffCapMs, BackoffInitialMs, BackoffJitterRatio, FocusSettleMs, HealthSampleSecs,
    HealthWindowSamples, HeartbeatIntervalSecs, KeystrokeDelayMs, LogBufferCapacity,
    QueueCapacity, SnapshotIntervalSecs, WatchDebounceMs,
};
use crate::error::ConfigError;
use crate::protocol::CapabilitySet;

/// Complete agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Broker WebSocket endpoint
    pub broker_url: String,
    /// Desktop-session label sent at registration
    pub user_session: String,
    /// Advertised capability tags
    pub capabilities: CapabilitySet,
    /// Heartbeat cadence while LIVE
    pub heartbeat: HeartbeatIntervalSecs,
    /// Reconnect backoff tuning
    pub backoff_initial: BackoffInitialMs,
    pub backoff_cap: BackoffCapMs,
    pub backoff_jitter: BackoffJitterRatio,
    /// Bound on the outbound frame queue toward the broker
    pub outbound_queue: QueueCapacity,
    /// Synthetic input tuning
    pub keystroke_delay: KeystrokeDelayMs,
    pub focus_settle: FocusSettleMs,
    /// Plugin manifest directory, when hot-reloadable aliases are wanted
    pub plugin_dir: Option<PathBuf>,
    /// Debounce for plugin-directory change notifications
    pub watch_debounce: WatchDebounceMs,
    /// Re-exec the agent when the plugin directory changes
    pub reexec_on_plugin_change: bool,
    /// Position-memory snapshot location; `None` disables persistence
    pub position_memory_path: Option<PathBuf>,
    pub snapshot_interval: SnapshotIntervalSecs,
    /// Health monitor geometry
    pub health_sample: HealthSampleSecs,
    pub health_window: HealthWindowSamples,
    /// Log ring buffer capacity
    pub log_buffer: LogBufferCapacity,
    /// Optional rotating file sink; `None` keeps logs in memory only
    pub log_file: Option<PathBuf>,
    /// Rotation threshold for the file sink
    pub log_file_max_bytes: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::development()
    }
}

impl AgentConfig {
    /// Development preset: localhost broker, capabilities for full control
    #[must_use]
    pub fn development() -> Self {
        let mut capabilities = CapabilitySet::new();
        capabilities.insert("control".to_string(), true);
        capabilities.insert("vscode_control".to_string(), true);
        capabilities.insert("hot_reload".to_string(), true);
        Self {
            broker_url: default_broker_url(),
            user_session: detect_user_session(),
            capabilities,
            heartbeat: HeartbeatIntervalSecs::default(),
            backoff_initial: BackoffInitialMs::default(),
            backoff_cap: BackoffCapMs::default(),
            backoff_jitter: BackoffJitterRatio::default(),
            outbound_queue: QueueCapacity::default(),
            keystroke_delay: KeystrokeDelayMs::default(),
            focus_settle: FocusSettleMs::default(),
            plugin_dir: None,
            watch_debounce: WatchDebounceMs::default(),
            reexec_on_plugin_change: false,
            position_memory_path: default_memory_path(),
            snapshot_interval: SnapshotIntervalSecs::default(),
            health_sample: HealthSampleSecs::default(),
            health_window: HealthWindowSamples::default(),
            log_buffer: LogBufferCapacity::default(),
            log_file: None,
            log_file_max_bytes: 10 * 1024 * 1024,
        }
    }

    /// Production preset: re-exec on plugin change enabled
    #[must_use]
    pub fn production() -> Self {
        Self {
            reexec_on_plugin_change: true,
            ..Self::development()
        }
    }

    /// Loads configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns an error when the file is unreadable, unparsable, or invalid.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.broker_url.starts_with("ws://") && !self.broker_url.starts_with("wss://") {
            return Err(ConfigError::Validation {
                field: "broker_url".to_string(),
                reason: "must be a ws:// or wss:// URL".to_string(),
            });
        }
        if self.user_session.trim().is_empty() {
            return Err(ConfigError::Validation {
                field: "user_session".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.backoff_cap.as_duration() < self.backoff_initial.as_duration() {
            return Err(ConfigError::Validation {
                field: "backoff_cap".to_string(),
                reason: "must be at least the initial backoff".to_string(),
            });
        }
        Ok(())
    }
}

fn default_broker_url() -> String {
    let port = std::env::var(PORT_ENV_VAR)
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);
    format!("ws://127.0.0.1:{port}/ws")
}

fn detect_user_session() -> String {
    std::env::var("USERNAME")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn default_memory_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("deskpilot").join("positions.json"))
}
