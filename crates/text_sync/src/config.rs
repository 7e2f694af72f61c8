//! Session configuration.
//!
//! Every field has a default, so a config file only needs to name what it
//! overrides:
//!
//! ```json
//! { "debounceMs": 50, "reconnect": { "maxAttempts": 3 } }
//! ```

use crate::error::{CollabError, CollabResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Exponential reconnect backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay.
    pub max_delay_ms: u64,
    /// Retries before a peer is given up on.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 250,
            max_delay_ms: 10_000,
            max_attempts: 8,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (0-based): `initial * 2^attempt`,
    /// capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Tunables for one document session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Window during which local operations are batched before broadcast.
    pub debounce_ms: u64,
    /// Largest number of operations in one broadcast.
    pub max_batch_ops: usize,
    /// Awareness entries without a refresh for this long are dropped.
    pub awareness_timeout_ms: u64,
    /// Buffered operations older than this are reported as a causal gap.
    pub causal_gap_warning_ms: u64,
    /// Period of the housekeeping tick (heartbeats, expiry, retries).
    pub tick_interval_ms: u64,
    /// Periodic snapshot save while dirty; disabled when absent.
    pub checkpoint_interval_ms: Option<u64>,
    /// How long a loaded snapshot waits for a peer's catch-up before it is
    /// seeded locally. Zero seeds on open.
    pub seed_wait_ms: u64,
    /// Prefix of derived session channel names.
    pub channel_prefix: String,
    pub reconnect: BackoffConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 30,
            max_batch_ops: 500,
            awareness_timeout_ms: 30_000,
            causal_gap_warning_ms: 60_000,
            tick_interval_ms: 1_000,
            checkpoint_interval_ms: None,
            seed_wait_ms: 1_500,
            channel_prefix: "codecollab".to_string(),
            reconnect: BackoffConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Parse a JSON config; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> CollabResult<Self> {
        let config: SessionConfig =
            serde_json::from_str(json).map_err(|e| CollabError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> CollabResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| CollabError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&content)
    }

    /// Reject values that would stall the session.
    pub fn validate(&self) -> CollabResult<()> {
        if self.tick_interval_ms == 0 {
            return Err(CollabError::Config("tickIntervalMs must be positive".into()));
        }
        if self.max_batch_ops == 0 {
            return Err(CollabError::Config("maxBatchOps must be positive".into()));
        }
        if self.awareness_timeout_ms == 0 {
            return Err(CollabError::Config(
                "awarenessTimeoutMs must be positive".into(),
            ));
        }
        if self.checkpoint_interval_ms == Some(0) {
            return Err(CollabError::Config(
                "checkpointIntervalMs must be positive".into(),
            ));
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(CollabError::Config(
                "reconnect.initialDelayMs exceeds maxDelayMs".into(),
            ));
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn causal_gap_warning(&self) -> Duration {
        Duration::from_millis(self.causal_gap_warning_ms)
    }

    pub fn seed_wait(&self) -> Duration {
        Duration::from_millis(self.seed_wait_ms)
    }

    pub fn checkpoint_interval(&self) -> Option<Duration> {
        self.checkpoint_interval_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.debounce(), Duration::from_millis(30));
        assert_eq!(config.awareness_timeout_ms, 30_000);
        assert_eq!(config.channel_prefix, "codecollab");
        assert!(config.checkpoint_interval().is_none());
        assert_eq!(config.seed_wait(), Duration::from_millis(1_500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            SessionConfig::from_json_str(r#"{"debounceMs": 50, "reconnect": {"maxAttempts": 3}}"#)
                .unwrap();
        assert_eq!(config.debounce_ms, 50);
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.initial_delay_ms, 250);
        assert_eq!(config.max_batch_ops, 500);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(SessionConfig::from_json_str(r#"{"tickIntervalMs": 0}"#).is_err());
        assert!(SessionConfig::from_json_str(r#"{"checkpointIntervalMs": 0}"#).is_err());
        assert!(SessionConfig::from_json_str("{not json").is_err());
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.delay_for(0), Duration::from_millis(250));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(500));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(2_000));
        assert_eq!(backoff.delay_for(10), Duration::from_millis(10_000));
        assert_eq!(backoff.delay_for(200), Duration::from_millis(10_000));
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"channelPrefix": "scratch"}}"#).unwrap();
        let config = SessionConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.channel_prefix, "scratch");

        assert!(SessionConfig::from_json_file("/nonexistent/config.json").is_err());
    }
}
