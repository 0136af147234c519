//! Client configuration
//!
//! Every timing constant of the join, reconnect and sync protocols lives here.
//! All fields have defaults so a partial JSON file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid JSON for this schema
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Retry shape of the join-call RPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinRetryConfig {
    /// Maximum number of join attempts
    pub max_attempts: u32,
    /// Linear backoff step; attempt `n` waits `n * step` before the next one
    pub backoff_step_ms: u64,
}

impl Default for JoinRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step_ms: 1_000,
        }
    }
}

/// Retry shape shared by the sync RPCs (subscriptions, mute state, answers)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncRetryConfig {
    /// Debounce window applied before sending
    pub debounce_ms: u64,
    /// Maximum number of attempts
    pub max_attempts: u32,
    /// Delay after failed attempt 1, 2, ...; the last value repeats
    pub backoff_ms: Vec<u64>,
}

impl Default for SyncRetryConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            max_attempts: 30,
            backoff_ms: vec![100, 300, 2_500],
        }
    }
}

impl SyncRetryConfig {
    /// Debounce window as a duration
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// A reconnect within this window after a disconnect uses the fast strategy
    pub reconnect_deadline_ms: u64,
    /// Join-call retry policy
    pub join: JoinRetryConfig,
    /// Subscription and mute-state sync policy
    pub sync: SyncRetryConfig,
    /// Send-answer retry policy
    pub answer_retry: SyncRetryConfig,
    /// How long to wait for the SFU join response
    pub socket_ready_timeout_ms: u64,
    /// Bounded wait of a join on a cleanup that is still running
    pub cleanup_wait_ms: u64,
    /// Leave the call when the network stays lost this long
    pub leave_after_disconnect_ms: Option<u64>,
    /// Period of stats reports while connected
    pub stats_interval_ms: Option<u64>,
    /// Capacity of the upward event channel
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_deadline_ms: 10_000,
            join: JoinRetryConfig::default(),
            sync: SyncRetryConfig::default(),
            answer_retry: SyncRetryConfig::default(),
            socket_ready_timeout_ms: 10_000,
            cleanup_wait_ms: 5_000,
            leave_after_disconnect_ms: Some(30_000),
            stats_interval_ms: Some(10_000),
            event_buffer: 256,
        }
    }
}

impl ClientConfig {
    /// Load and validate a configuration from a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, parsed or fails validation
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.join.max_attempts == 0 {
            return Err(ConfigError::Invalid("join.max_attempts must be > 0".into()));
        }
        for (name, sync) in [("sync", &self.sync), ("answer_retry", &self.answer_retry)] {
            if sync.max_attempts == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name}.max_attempts must be > 0"
                )));
            }
            if sync.backoff_ms.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "{name}.backoff_ms must not be empty"
                )));
            }
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid("event_buffer must be > 0".into()));
        }
        if self.socket_ready_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "socket_ready_timeout_ms must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Fast-reconnect window
    #[must_use]
    pub fn reconnect_deadline(&self) -> Duration {
        Duration::from_millis(self.reconnect_deadline_ms)
    }

    /// Join response timeout
    #[must_use]
    pub fn socket_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_ready_timeout_ms)
    }

    /// Cleanup wait bound
    #[must_use]
    pub fn cleanup_wait(&self) -> Duration {
        Duration::from_millis(self.cleanup_wait_ms)
    }

    /// Offline duration after which the call is left
    #[must_use]
    pub fn leave_after_disconnect(&self) -> Option<Duration> {
        self.leave_after_disconnect_ms.map(Duration::from_millis)
    }

    /// Stats report period
    #[must_use]
    pub fn stats_interval(&self) -> Option<Duration> {
        self.stats_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.reconnect_deadline(), Duration::from_secs(10));
        assert_eq!(config.join.max_attempts, 3);
        assert_eq!(config.sync.backoff_ms, vec![100, 300, 2_500]);
        assert_eq!(config.sync.max_attempts, 30);
        assert_eq!(config.cleanup_wait(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"reconnect_deadline_ms": 5000, "sync": {"debounce_ms": 50}}"#)
                .unwrap();
        assert_eq!(config.reconnect_deadline_ms, 5_000);
        assert_eq!(config.sync.debounce_ms, 50);
        assert_eq!(config.sync.max_attempts, 30);
        assert_eq!(config.join, JoinRetryConfig::default());
    }

    #[test]
    fn test_null_disables_optional_timers() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"leave_after_disconnect_ms": null, "stats_interval_ms": null}"#,
        )
        .unwrap();
        assert_eq!(config.leave_after_disconnect(), None);
        assert_eq!(config.stats_interval(), None);
    }

    #[test]
    fn test_validate_rejects_empty_backoff() {
        let mut config = ClientConfig::default();
        config.answer_retry.backoff_ms.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("answer_retry.backoff_ms"));
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"join": {{"max_attempts": 5, "backoff_step_ms": 10}}}}"#).unwrap();

        let config = ClientConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.join.max_attempts, 5);
        assert_eq!(config.join.backoff_step_ms, 10);
    }

    #[test]
    fn test_from_json_file_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"join": {{"max_attempts": 0}}}}"#).unwrap();
        assert!(matches!(
            ClientConfig::from_json_file(file.path()),
            Err(ConfigError::Invalid(_))
        ));

        let missing = ClientConfig::from_json_file("/nonexistent/sfu-call.json");
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
