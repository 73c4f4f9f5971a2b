//! Session settings shared by the server and client runners.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::net::protocol::{DEFAULT_PORT, DEFAULT_TICK_RATE};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Validation(String),
}

/// When the server sends a world update to joined clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastPolicy {
    /// Only ticks with queued global events or dirty components.
    #[default]
    WhenChanged,
    /// Every tick, even if the update is empty.
    EveryTick,
}

/// What happens to component dirty flags after a broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirtyPolicy {
    #[default]
    ClearOnSend,
    /// Dirty components are resent every tick until something cleans them.
    Retransmit,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub address: String,
    pub port: u16,
    pub tick_rate: u32,
    pub max_clients: usize,
    pub max_messages_per_tick: usize,
    pub broadcast: BroadcastPolicy,
    pub dirty: DirtyPolicy,
    pub timeout_secs: u64,
    pub username: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            tick_rate: DEFAULT_TICK_RATE,
            max_clients: 64,
            max_messages_per_tick: 256,
            broadcast: BroadcastPolicy::default(),
            dirty: DirtyPolicy::default(),
            timeout_secs: 10,
            username: "guest".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_rate == 0 {
            return Err(ConfigError::Validation("tick_rate must be positive".into()));
        }
        if self.max_messages_per_tick == 0 {
            return Err(ConfigError::Validation(
                "max_messages_per_tick must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = SessionConfig::from_toml_str("").unwrap();
        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.socket_addr(), "127.0.0.1:10555");
        assert_eq!(config.max_messages_per_tick, 256);
    }

    #[test]
    fn policies_parse_snake_case() {
        let config = SessionConfig::from_toml_str(
            r#"
            port = 4000
            broadcast = "every_tick"
            dirty = "retransmit"
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.broadcast, BroadcastPolicy::EveryTick);
        assert_eq!(config.dirty, DirtyPolicy::Retransmit);
        assert_eq!(config.tick_rate, 60);
    }

    #[test]
    fn rejects_zero_tick_rate() {
        assert!(matches!(
            SessionConfig::from_toml_str("tick_rate = 0"),
            Err(ConfigError::Validation(_))
        ));
        assert!(matches!(
            SessionConfig::from_toml_str("broadcast = \"sometimes\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
