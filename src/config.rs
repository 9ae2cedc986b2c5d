//! Configuration management for ratewindow.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{RateWindowError, Result};
use crate::ratelimit::FailurePolicy;

/// Main configuration for a rate limiter and its counter store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateWindowConfig {
    /// Rate limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Maximum events admitted per window
    #[serde(default = "default_requests_limit")]
    pub requests_limit: u64,

    /// Window size in milliseconds
    #[serde(default = "default_window_size_ms")]
    pub window_size_ms: u64,

    /// Whether to admit or reject requests when the store fails
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            requests_limit: default_requests_limit(),
            window_size_ms: default_window_size_ms(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

fn default_requests_limit() -> u64 {
    5
}

fn default_window_size_ms() -> u64 {
    60_000
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Age in milliseconds after which a window may be evicted.
    /// Defaults to twice the window size.
    #[serde(default)]
    pub expiration_time_ms: Option<u64>,

    /// How often expired windows are flushed, in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            expiration_time_ms: None,
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

fn default_flush_interval_ms() -> u64 {
    10_000
}

impl RateWindowConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RateWindowConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RateWindowError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration describes a usable limiter.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.requests_limit == 0 {
            return Err(RateWindowError::Config(
                "limiter.requests_limit must be greater than zero".to_string(),
            ));
        }
        if self.limiter.window_size_ms == 0 {
            return Err(RateWindowError::Config(
                "limiter.window_size_ms must be greater than zero".to_string(),
            ));
        }
        if self.store.flush_interval_ms == 0 {
            return Err(RateWindowError::Config(
                "store.flush_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.expiration_time() < self.window_size() {
            // The previous window would be gone before it stops counting.
            return Err(RateWindowError::Config(format!(
                "store.expiration_time_ms ({}) must be at least limiter.window_size_ms ({})",
                self.expiration_time().as_millis(),
                self.limiter.window_size_ms
            )));
        }
        Ok(())
    }

    /// Get the window size.
    pub fn window_size(&self) -> Duration {
        Duration::from_millis(self.limiter.window_size_ms)
    }

    /// Get the expiration time, defaulting to twice the window size.
    pub fn expiration_time(&self) -> Duration {
        match self.store.expiration_time_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.window_size().saturating_mul(2),
        }
    }

    /// Get the flush interval.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.store.flush_interval_ms)
    }
}
