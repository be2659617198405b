//! Configuration loading for the sync coordinator.
//!
//! Configuration is loaded from a TOML file (e.g. `liftsync.toml`). Every
//! field has a default, so an empty file (or [`CoordinatorConfig::default`])
//! is a working configuration for the handheld side.

use std::path::PathBuf;
use std::time::Duration;

use liftsync_core::RetryPolicy;
use liftsync_types::DeviceRole;
use serde::Deserialize;

/// Root configuration for a sync coordinator.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoordinatorConfig {
    /// Device role and timing.
    #[serde(default)]
    pub coordinator: CoordinatorSection,
    /// Retry backoff for queued operations.
    #[serde(default)]
    pub retry: RetrySection,
    /// Queue and tracking bounds.
    #[serde(default)]
    pub queue: QueueSection,
}

/// Device role and timing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorSection {
    /// Which side of the pair this process runs on (default: handheld).
    #[serde(default = "default_role")]
    pub role: DeviceRole,
    /// Heartbeat period in milliseconds (default: 10s).
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Age after which the last heartbeat no longer proves a live link
    /// (default: 30s). Must exceed the heartbeat interval.
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    /// Upper bound on a single transport send (default: 5s).
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

/// Retry backoff configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    /// Delay after the first failed flush attempt (default: 1s).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Cap on any single delay (default: 60s).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Failed attempts before an operation is given up (default: 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Random jitter added to retry timers (default: 500ms).
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

/// Queue and tracking bounds.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSection {
    /// Maximum pending operations (default: 1000).
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Out-of-order sequences remembered per origin (default: 1024).
    #[serde(default = "default_applied_window")]
    pub applied_window: usize,
    /// Entities tracked by the conflict resolver (default: 256).
    #[serde(default = "default_conflict_window")]
    pub conflict_window: usize,
}

// Default value functions
fn default_role() -> DeviceRole {
    DeviceRole::Handheld
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_stale_after_ms() -> u64 {
    30_000
}

fn default_send_timeout_ms() -> u64 {
    5_000
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

/// Upper bound on every millisecond setting: one day.
pub const MAX_INTERVAL_MS: u64 = 86_400_000;

fn default_max_attempts() -> u32 {
    5
}

fn default_jitter_ms() -> u64 {
    500
}

fn default_capacity() -> usize {
    1_000
}

fn default_applied_window() -> usize {
    1_024
}

fn default_conflict_window() -> usize {
    256
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            role: default_role(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            stale_after_ms: default_stale_after_ms(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            applied_window: default_applied_window(),
            conflict_window: default_conflict_window(),
        }
    }
}

impl CoordinatorConfig {
    /// Default configuration for the given role.
    pub fn for_role(role: DeviceRole) -> Self {
        let mut config = Self::default();
        config.coordinator.role = role;
        config
    }

    /// Load configuration from a TOML file and validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// [`CoordinatorConfig::validate`].
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.coordinator;
        for (name, value) in [
            ("heartbeat_interval_ms", c.heartbeat_interval_ms),
            ("stale_after_ms", c.stale_after_ms),
            ("send_timeout_ms", c.send_timeout_ms),
            ("base_delay_ms", self.retry.base_delay_ms),
            ("max_delay_ms", self.retry.max_delay_ms),
            ("jitter_ms", self.retry.jitter_ms),
        ] {
            if value > MAX_INTERVAL_MS {
                return Err(ConfigError::Invalid(format!(
                    "{} ({}) must be at most {}",
                    name, value, MAX_INTERVAL_MS
                )));
            }
        }
        if c.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat_interval_ms must be > 0".into()));
        }
        if c.send_timeout_ms == 0 {
            return Err(ConfigError::Invalid("send_timeout_ms must be > 0".into()));
        }
        if c.stale_after_ms <= c.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "stale_after_ms ({}) must exceed heartbeat_interval_ms ({})",
                c.stale_after_ms, c.heartbeat_interval_ms
            )));
        }
        if self.retry.base_delay_ms == 0 {
            return Err(ConfigError::Invalid("base_delay_ms must be > 0".into()));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::Invalid(
                "max_delay_ms must be >= base_delay_ms".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be > 0".into()));
        }
        if self.queue.capacity == 0 {
            return Err(ConfigError::Invalid("queue capacity must be > 0".into()));
        }
        Ok(())
    }

    /// Heartbeat period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.coordinator.heartbeat_interval_ms)
    }

    /// Heartbeat staleness threshold.
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.coordinator.stale_after_ms)
    }

    /// Bound on a single send.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.coordinator.send_timeout_ms)
    }

    /// Backoff policy for the pending queue.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            max_attempts: self.retry.max_attempts,
            jitter: Duration::from_millis(self.retry.jitter_ms),
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// Values parsed but are inconsistent.
    #[error("invalid config: {0}")]
    Invalid(String),
}
