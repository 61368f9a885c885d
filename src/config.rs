//! Configuration management for pairlink
//!
//! Timing of presence heartbeats and retries, the network identity lookup,
//! and transport ICE servers. Values come from an optional TOML file
//! overlaid with `PAIRLINK_`-prefixed environment variables
//! (e.g. `PAIRLINK_PRESENCE__HEARTBEAT_INTERVAL_MS=10000`).

use crate::errors::SignalError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PairlinkConfig {
    pub presence: PresenceConfig,
    pub retry: RetryConfig,
    pub identity: IdentityConfig,
    pub transport: TransportConfig,
}

/// Presence heartbeat and liveness
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Period between `lastSeen` refreshes
    pub heartbeat_interval_ms: u64,
    /// Maximum age of `lastSeen` for a peer to be discoverable
    pub liveness_window_ms: u64,
}

/// Backoff between discovery polls and connection attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Wait before polling discovery again after an empty result
    pub discovery_poll_ms: u64,
    /// Wait after a failed or dropped connection before rediscovering
    pub reconnect_backoff_ms: u64,
    /// Wait before restarting after a failed registration
    pub registration_retry_ms: u64,
    /// Upper bound on one attempt reaching `connected`
    pub negotiation_timeout_ms: u64,
}

/// Public network identity lookup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Endpoint answering `{"ip": "..."}`
    pub lookup_url: String,
    pub timeout_ms: u64,
    /// Identity used when the lookup fails
    pub fallback: String,
}

/// Peer-to-peer transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub ice_servers: Vec<String>,
    /// Label of the data channel the initiator opens
    pub channel_label: String,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            liveness_window_ms: 60_000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            discovery_poll_ms: 5_000,
            reconnect_backoff_ms: 5_000,
            registration_retry_ms: 5_000,
            negotiation_timeout_ms: 30_000,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            lookup_url: "https://api.ipify.org?format=json".to_string(),
            timeout_ms: 5_000,
            fallback: crate::identity::FALLBACK_IDENTITY.to_string(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            channel_label: "vibration-control".to_string(),
        }
    }
}

impl PresenceConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.liveness_window_ms)
    }
}

impl RetryConfig {
    pub fn discovery_poll(&self) -> Duration {
        Duration::from_millis(self.discovery_poll_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn registration_retry(&self) -> Duration {
        Duration::from_millis(self.registration_retry_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}

impl PairlinkConfig {
    /// Load configuration from a TOML file plus environment overrides.
    /// A missing file yields the defaults (still overridable from the environment).
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, SignalError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
        }

        let settings = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix("PAIRLINK")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("transport.ice_servers"),
            )
            .build()
            .map_err(|e| SignalError::Config(format!("Failed to read config: {}", e)))?;

        let config: PairlinkConfig = settings
            .try_deserialize()
            .map_err(|e| SignalError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate().map_err(SignalError::Config)?;
        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), SignalError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                SignalError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| SignalError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| SignalError::Config(format!("Failed to write config file: {}", e)))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from("pairlink.toml")
    }

    /// Load from default location or fall back to defaults
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    pub fn to_toml(&self) -> Result<String, SignalError> {
        toml::to_string_pretty(self)
            .map_err(|e| SignalError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.presence.heartbeat_interval_ms == 0 {
            return Err("Heartbeat interval must be positive".to_string());
        }
        if self.presence.liveness_window_ms <= self.presence.heartbeat_interval_ms {
            return Err("Liveness window must exceed the heartbeat interval".to_string());
        }
        if self.retry.discovery_poll_ms == 0
            || self.retry.reconnect_backoff_ms == 0
            || self.retry.registration_retry_ms == 0
        {
            return Err("Retry delays must be positive".to_string());
        }
        if self.retry.negotiation_timeout_ms == 0 {
            return Err("Negotiation timeout must be positive".to_string());
        }
        if self.identity.fallback.is_empty() {
            return Err("Identity fallback must not be empty".to_string());
        }
        if self.transport.channel_label.is_empty() {
            return Err("Channel label must not be empty".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PairlinkConfig::default();
        assert_eq!(config.presence.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.presence.liveness_window(), Duration::from_secs(60));
        assert_eq!(config.retry.reconnect_backoff(), Duration::from_secs(5));
        assert_eq!(config.identity.fallback, "local-fallback-ip");
        assert_eq!(config.transport.ice_servers.len(), 2);
    }

    #[test]
    fn test_config_validation() {
        let config = PairlinkConfig::default();
        assert!(config.validate().is_ok());

        let mut bad = config.clone();
        bad.presence.heartbeat_interval_ms = 0;
        assert!(bad.validate().is_err());

        let mut bad = config.clone();
        bad.presence.liveness_window_ms = bad.presence.heartbeat_interval_ms;
        assert!(bad.validate().is_err());

        let mut bad = config;
        bad.retry.discovery_poll_ms = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_config_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("pairlink.toml");

        let mut config = PairlinkConfig::default();
        config.presence.heartbeat_interval_ms = 10_000;
        config.retry.discovery_poll_ms = 1_500;
        config.save_to_file(&path).unwrap();

        let loaded = PairlinkConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.presence.heartbeat_interval_ms, 10_000);
        assert_eq!(loaded.retry.discovery_poll_ms, 1_500);
        assert_eq!(loaded.presence.liveness_window_ms, 60_000);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(&path, "[retry]\nreconnect_backoff_ms = 750\n").unwrap();

        let loaded = PairlinkConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.retry.reconnect_backoff_ms, 750);
        assert_eq!(loaded.retry.discovery_poll_ms, 5_000);
        assert_eq!(loaded.presence.heartbeat_interval_ms, 30_000);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[presence]\nheartbeat_interval_ms = 0\n").unwrap();

        let result = PairlinkConfig::load_from_file(&path);
        assert!(matches!(result, Err(SignalError::Config(_))));
    }

    #[test]
    fn test_config_toml_format() {
        let toml_string = PairlinkConfig::default().to_toml().unwrap();
        assert!(toml_string.contains("[presence]"));
        assert!(toml_string.contains("[retry]"));
        assert!(toml_string.contains("[identity]"));
        assert!(toml_string.contains("[transport]"));
        assert!(toml_string.contains("heartbeat_interval_ms"));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = PairlinkConfig::load_from_file("nonexistent_pairlink.toml");
        assert!(result.is_ok());
        assert_eq!(result.unwrap().presence.heartbeat_interval_ms, 30_000);
    }
}
