use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::storage::{Error, Result};

/// How a detected duplicate is folded into its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Merge inside the uploading transaction and post an "updated" activity.
    Synchronous,
    /// Hide the duplicate now, merge on the worker pool after commit.
    #[default]
    Deferred,
}

/// How the resolver finds the sibling carrying the canonical name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LookupStrategy {
    /// Enumerate the folder. Always consistent, linear in the number of siblings.
    #[default]
    Scan,
    /// Ask the store for the child by name. Fast, but may miss very recent siblings.
    Indexed,
}

/// Bounds for retrying transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 20,
            max_backoff_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let millis = self.initial_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }
}

/// Engine settings, stored as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub strategy: Strategy,
    pub lookup: LookupStrategy,
    /// Size of the merge worker pool (deferred strategy only).
    pub workers: usize,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            strategy: Strategy::default(),
            lookup: LookupStrategy::default(),
            workers: 4,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Reads and validates a configuration file. Missing fields take their defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read(path).await.map_err(|e| {
            warn!("Failed to read config file '{}': {}", path.display(), e);
            Error::ConfigNotFound(path.to_path_buf())
        })?;

        let config: EngineConfig = serde_json::from_slice(&content).map_err(|e| {
            warn!("Failed to parse config file '{}': {}", path.display(), e);
            Error::InvalidConfig(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        debug!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    /// Writes the configuration as pretty-printed JSON.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).await?;
        debug!("Engine config written to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::InvalidConfig("workers must be at least 1".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::InvalidConfig("retry.max_attempts must be at least 1".to_string()));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(Error::InvalidConfig(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}
