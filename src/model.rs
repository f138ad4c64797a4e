//! Core domain types: `Job`, `Item`, phase configuration, checkpoints, and
//! the job definition/options accepted at submission.
//!
//! Plain, serializable structs with `as_str`/`from_str` enums persisted
//! as TEXT columns.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("invalid job status: {other}")),
        }
    }

    /// Terminal status is final except that FAILED and PAUSED are
    /// resumable back to RUNNING.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Failed | Self::Paused)
    }
}

/// Item processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("invalid item status: {other}")),
        }
    }
}

/// Backoff family for a phase's retry strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Exponential,
    Linear,
    Constant,
}

impl BackoffKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exponential => "exponential",
            Self::Linear => "linear",
            Self::Constant => "constant",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            "constant" => Ok(Self::Constant),
            other => Err(format!("invalid backoff kind: {other}")),
        }
    }

    /// The backoff multiplier for retry attempt `r`.
    pub fn factor(&self, r: u32) -> u64 {
        match self {
            Self::Exponential => 1u64 << r.min(62),
            Self::Linear => (r as u64) + 1,
            Self::Constant => 1,
        }
    }
}

/// Retry strategy for a single phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStrategy {
    pub max_retries: u32,
    pub backoff: BackoffKind,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff: BackoffKind::Exponential,
        }
    }
}

/// Optional per-phase validation config.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhaseValidation {
    pub min_score: f64,
}

/// A single phase in the job's ordered pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    pub name: String,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub use_rag: bool,
    #[serde(default)]
    pub validation: Option<PhaseValidation>,
    #[serde(default)]
    pub retry: RetryStrategy,
}

impl PhaseConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            task_type: None,
            model: None,
            use_rag: false,
            validation: None,
            retry: RetryStrategy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryStrategy) -> Self {
        self.retry = retry;
        self
    }
}

/// Execution options accepted at submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default = "JobOptions::default_concurrency")]
    pub concurrency: u32,
    #[serde(default = "JobOptions::default_checkpoint_frequency")]
    pub checkpoint_frequency: u32,
    #[serde(default = "JobOptions::default_auto_start")]
    pub auto_start: bool,
}

impl JobOptions {
    fn default_concurrency() -> u32 {
        5
    }
    fn default_checkpoint_frequency() -> u32 {
        10
    }
    fn default_auto_start() -> bool {
        true
    }
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            concurrency: Self::default_concurrency(),
            checkpoint_frequency: Self::default_checkpoint_frequency(),
            auto_start: Self::default_auto_start(),
        }
    }
}

/// One input entry in a job submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemInput {
    pub input: String,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

/// A job definition as accepted by `JobManager::create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    pub items: Vec<ItemInput>,
    pub phases: Vec<PhaseConfig>,
    #[serde(default)]
    pub options: JobOptions,
}

/// Per-item error record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub phase: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub retry_attempt: Option<u32>,
    #[serde(default)]
    pub dead_letter: bool,
}

/// Per-item and per-job resource accounting (cost, tokens, processing time).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Accounting {
    pub cost: Decimal,
    pub tokens: u64,
}

impl Accounting {
    pub fn add(&mut self, other: Accounting) {
        self.cost += other.cost;
        self.tokens += other.tokens;
    }
}

/// One input item flowing through the pipeline, identified by
/// `(job_id, item_index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub job_id: String,
    pub item_index: u32,
    pub input: String,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
    pub output: Option<String>,
    pub phase_outputs: HashMap<String, String>,
    pub status: ItemStatus,
    pub current_phase: Option<String>,
    pub retry_count: u32,
    pub errors: Vec<JobError>,
    pub accounting: Accounting,
    pub processing_time_ms: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Item {
    pub fn new(job_id: impl Into<String>, item_index: u32, input: ItemInput) -> Self {
        Self {
            job_id: job_id.into(),
            item_index,
            input: input.input,
            metadata: input.metadata,
            output: None,
            phase_outputs: HashMap::new(),
            status: ItemStatus::Pending,
            current_phase: None,
            retry_count: 0,
            errors: Vec::new(),
            accounting: Accounting::default(),
            processing_time_ms: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// A dead-lettered item carries exactly `max_retries + 1` error
    /// records, the last with `dead_letter = true`.
    pub fn is_dead_lettered(&self) -> bool {
        self.status == ItemStatus::Failed
            && self.errors.last().is_some_and(|e| e.dead_letter)
    }
}

/// Per-phase progress snapshot carried in a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PhaseProgress {
    pub last_completed_index: i64,
    pub items_processed: u64,
    pub items_failed: u64,
}

/// Aggregate counter/accounting snapshot embedded in a checkpoint. Advisory
/// only — the source of truth is always the Item rows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct CheckpointCounters {
    pub completed_items: u64,
    pub failed_items: u64,
    pub cost: Decimal,
    pub tokens: u64,
}

/// Durable resumable state attached to a `Job`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    pub timestamp: DateTime<Utc>,
    pub current_phase: String,
    pub completed_phases: Vec<String>,
    pub last_completed_item_index: i64,
    pub total_items: u64,
    pub counters: CheckpointCounters,
    pub phase_progress: HashMap<String, PhaseProgress>,
}

impl CheckpointSnapshot {
    pub fn new(total_items: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            current_phase: String::new(),
            completed_phases: Vec::new(),
            last_completed_item_index: -1,
            total_items,
            counters: CheckpointCounters::default(),
            phase_progress: HashMap::new(),
        }
    }
}

/// A submitted batch job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub group_id: Option<String>,
    pub user_id: Option<String>,
    pub status: JobStatus,
    pub phases: Vec<PhaseConfig>,
    pub options: JobOptions,
    pub total_items: u64,
    pub completed_items: u64,
    pub failed_items: u64,
    pub accounting: Accounting,
    pub current_phase: Option<String>,
    pub checkpoint: Option<CheckpointSnapshot>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl Job {
    pub fn percent_complete(&self) -> f64 {
        if self.total_items == 0 {
            0.0
        } else {
            (self.completed_items as f64 / self.total_items as f64) * 100.0
        }
    }

    /// Linear projection from the elapsed time per completed item so far.
    /// `None` unless the job is RUNNING, has started, and has completed at
    /// least one item — there is no basis for a projection otherwise.
    pub fn estimated_time_remaining_ms(&self, now: DateTime<Utc>) -> Option<u64> {
        if self.status != JobStatus::Running || self.completed_items == 0 {
            return None;
        }
        let started_at = self.started_at?;
        let elapsed_ms = (now - started_at).num_milliseconds().max(0) as u64;
        let remaining_items = self.total_items.saturating_sub(self.completed_items);
        Some(elapsed_ms / self.completed_items * remaining_items)
    }
}
