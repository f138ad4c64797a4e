//! Layered engine configuration.
//!
//! Defaults, overridden by an optional TOML file, overridden by
//! environment variables — scoped to the handful of tunables the Batch
//! Executor and Checkpoint Store need.
//!
//! # Configuration file format
//!
//! ```toml
//! [engine]
//! chunk_size = 500
//! item_timeout_secs = 300
//! reconciliation_interval_items = 50
//! retry_base_delay_ms = 1000
//! checkpoint_time_interval_secs = 300
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::errors::{ConfigError, ValidationError};

/// Inclusive bound helper, preferring explicit range checks over silent
/// clamping.
fn bounded(value: u32, lo: u32, hi: u32, err: impl FnOnce(u32) -> ValidationError) -> Result<u32, ValidationError> {
    if value < lo || value > hi {
        Err(err(value))
    } else {
        Ok(value)
    }
}

/// Engine-wide tunables, independent of any single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Chunk size for iterating a phase's work set.
    pub chunk_size: usize,
    /// Per-item Processor invocation timeout.
    pub item_timeout: Duration,
    /// Item-completion count that triggers analytics reconciliation.
    pub reconciliation_interval_items: u64,
    /// Base delay for the retry backoff formula.
    pub retry_base_delay: Duration,
    /// Wall-time-based checkpoint trigger.
    pub checkpoint_time_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            item_timeout: Duration::from_secs(300),
            reconciliation_interval_items: 50,
            retry_base_delay: Duration::from_millis(1000),
            checkpoint_time_interval: Duration::from_secs(300),
        }
    }
}

/// Raw TOML shape for `[engine]` overrides.
#[derive(Debug, Default, Deserialize)]
struct EngineConfigFile {
    #[serde(default)]
    engine: EngineConfigSection,
}

#[derive(Debug, Default, Deserialize)]
struct EngineConfigSection {
    chunk_size: Option<usize>,
    item_timeout_secs: Option<u64>,
    reconciliation_interval_items: Option<u64>,
    retry_base_delay_ms: Option<u64>,
    checkpoint_time_interval_secs: Option<u64>,
}

impl EngineConfig {
    /// Load defaults, then apply an optional TOML file, then environment
    /// variables (`FORGEBATCH_*`), in that order — file beats defaults, env
    /// beats file.
    pub fn load(file_path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = file_path
            && path.exists()
        {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read engine config at {}", path.display()))?;
            let parsed: EngineConfigFile = toml::from_str(&content)
                .with_context(|| format!("failed to parse engine config at {}", path.display()))?;
            config.apply_file(parsed.engine);
        }

        config.apply_env();
        config.validate().context("invalid engine configuration")?;
        Ok(config)
    }

    /// Rejects tunables outside their accepted range instead of clamping
    /// them, so a mistyped override fails loudly at startup.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || self.chunk_size > 10_000 {
            return Err(ConfigError::ChunkSizeRange { value: self.chunk_size });
        }
        let item_timeout_secs = self.item_timeout.as_secs();
        if item_timeout_secs == 0 || item_timeout_secs > 3600 {
            return Err(ConfigError::ItemTimeoutRange { value: item_timeout_secs });
        }
        if self.reconciliation_interval_items == 0 || self.reconciliation_interval_items > 10_000 {
            return Err(ConfigError::ReconciliationIntervalRange { value: self.reconciliation_interval_items });
        }
        let retry_base_delay_ms = self.retry_base_delay.as_millis() as u64;
        if retry_base_delay_ms > 60_000 {
            return Err(ConfigError::RetryBaseDelayRange { value: retry_base_delay_ms });
        }
        let checkpoint_time_interval_secs = self.checkpoint_time_interval.as_secs();
        if checkpoint_time_interval_secs == 0 || checkpoint_time_interval_secs > 86_400 {
            return Err(ConfigError::CheckpointTimeIntervalRange { value: checkpoint_time_interval_secs });
        }
        Ok(())
    }

    fn apply_file(&mut self, section: EngineConfigSection) {
        if let Some(v) = section.chunk_size {
            self.chunk_size = v;
        }
        if let Some(v) = section.item_timeout_secs {
            self.item_timeout = Duration::from_secs(v);
        }
        if let Some(v) = section.reconciliation_interval_items {
            self.reconciliation_interval_items = v;
        }
        if let Some(v) = section.retry_base_delay_ms {
            self.retry_base_delay = Duration::from_millis(v);
        }
        if let Some(v) = section.checkpoint_time_interval_secs {
            self.checkpoint_time_interval = Duration::from_secs(v);
        }
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("FORGEBATCH_CHUNK_SIZE")
            && let Ok(v) = v.parse()
        {
            self.chunk_size = v;
        }
        if let Ok(v) = std::env::var("FORGEBATCH_ITEM_TIMEOUT_SECS")
            && let Ok(v) = v.parse()
        {
            self.item_timeout = Duration::from_secs(v);
        }
        if let Ok(v) = std::env::var("FORGEBATCH_RETRY_BASE_DELAY_MS")
            && let Ok(v) = v.parse()
        {
            self.retry_base_delay = Duration::from_millis(v);
        }
    }
}

/// Validates the options supplied on a `JobDefinition` against the
/// engine's authoritative bounds. Values outside range are rejected,
/// never clamped.
pub fn validate_concurrency(value: u32) -> Result<u32, ValidationError> {
    bounded(value, 1, 50, |v| ValidationError::ConcurrencyRange { value: v })
}

pub fn validate_checkpoint_frequency(value: u32) -> Result<u32, ValidationError> {
    bounded(value, 1, 100, |v| ValidationError::CheckpointFrequencyRange { value: v })
}

pub fn validate_list_limit(value: u32) -> Result<u32, ValidationError> {
    bounded(value, 1, 100, |v| ValidationError::LimitRange { value: v })
}

pub fn validate_older_than_days(value: u32) -> Result<u32, ValidationError> {
    bounded(value, 1, 365, |v| ValidationError::OlderThanDaysRange { value: v })
}
