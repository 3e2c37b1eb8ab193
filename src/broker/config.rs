//! Broker configuration with environment presets
//!
//! Mirrors the operational defaults: port 9998 (overridable through
//! `DESKPILOT_PORT`), a 15 s liveness sweep, and a 60 s dead timeout.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain_types::{
    CommandTimeoutSecs, DeadTimeoutSecs, LivenessSweepSecs, QueueCapacity,
};
use crate::error::ConfigError;

/// Environment variable overriding the listen port
pub const PORT_ENV_VAR: &str = "DESKPILOT_PORT";

/// Default listen port
pub const DEFAULT_PORT: u16 = 9998;

/// Complete broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Interface to bind
    pub bind_host: String,
    /// Listen port
    pub port: u16,
    /// Cadence of the liveness sweep
    pub liveness_sweep: LivenessSweepSecs,
    /// Idle time before a connection is declared dead
    pub dead_timeout: DeadTimeoutSecs,
    /// Default deadline for forwarded commands
    pub forward_timeout: CommandTimeoutSecs,
    /// Bound on each per-connection outbound queue
    pub outbound_queue: QueueCapacity,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::development()
    }
}

impl BrokerConfig {
    /// Development preset: localhost bind, spec-default timings
    #[must_use]
    pub fn development() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            port: port_from_env(),
            liveness_sweep: LivenessSweepSecs::default(),
            dead_timeout: DeadTimeoutSecs::default(),
            forward_timeout: CommandTimeoutSecs::default(),
            outbound_queue: QueueCapacity::default(),
        }
    }

    /// Production preset: all-interfaces bind, larger outbound queues
    ///
    /// # Panics
    ///
    /// Panics if the hardcoded queue bound is outside its domain range.
    #[must_use]
    pub fn production() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: port_from_env(),
            outbound_queue: QueueCapacity::try_new(1024).unwrap(),
            ..Self::development()
        }
    }

    /// Loads configuration from a TOML file, then applies the env override
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// parsed values violate validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Self = toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        if let Some(port) = env_port_override() {
            config.port = port;
        }
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_host.is_empty() {
            return Err(ConfigError::Validation {
                field: "bind_host".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if self.port == 0 {
            return Err(ConfigError::Validation {
                field: "port".to_string(),
                reason: "must be nonzero".to_string(),
            });
        }
        if self.dead_timeout.as_duration() <= self.liveness_sweep.as_duration() {
            return Err(ConfigError::Validation {
                field: "dead_timeout".to_string(),
                reason: "must exceed the liveness sweep interval".to_string(),
            });
        }
        Ok(())
    }

    /// The socket address string to bind
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }
}

fn env_port_override() -> Option<u16> {
    std::env::var(PORT_ENV_VAR).ok()?.parse().ok()
}

fn port_from_env() -> u16 {
    env_port_override().unwrap_or(DEFAULT_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn development_defaults_follow_the_protocol_constants() {
        let config = BrokerConfig::development();
        assert!(config.validate().is_ok());
        assert_eq!(config.liveness_sweep.into_inner(), 15);
        assert_eq!(config.dead_timeout.into_inner(), 60);
        assert_eq!(config.forward_timeout.as_u64(), 30);
        assert_eq!(config.outbound_queue.as_usize(), 256);
    }

    #[test]
    fn dead_timeout_must_exceed_sweep() {
        let mut config = BrokerConfig::development();
        config.dead_timeout = DeadTimeoutSecs::try_new(10).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_parses_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.toml");
        std::fs::write(
            &path,
            r#"
bind_host = "127.0.0.1"
port = 9998
liveness_sweep = 15
dead_timeout = 60
forward_timeout = 30
outbound_queue = 256
"#,
        )
        .unwrap();
        let config = BrokerConfig::load(&path).unwrap();
        assert_eq!(config.bind_host, "127.0.0.1");
        assert_eq!(config.liveness_sweep.into_inner(), 15);
    }
}
