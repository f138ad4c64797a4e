//! Typed error hierarchy for the batch execution engine.
//!
//! Four top-level enums cover the error-handling tiers described by the
//! engine's contract:
//! - `ValidationError` — job definitions and control inputs outside stated bounds
//! - `IllegalStateError` — control transitions forbidden by the job's current status
//! - `NotFoundError` — an operation referenced an unknown job
//! - `ExecutionError` — uncaught failures outside a per-item task; fatal to the job
//!
//! A fifth type, `ConfigError`, stands apart from `EngineError`: it is
//! raised by `EngineConfig::load` before any `JobManager` exists, so it has
//! no job to attach to and is returned on its own.

use thiserror::Error;

use crate::model::JobStatus;

/// Errors surfaced synchronously at the Job Manager boundary when a job
/// definition or control input falls outside the allowed bounds.
#[derive(Debug, Error, PartialEq, Clone)]
pub enum ValidationError {
    #[error("name must be 1-200 characters, got {len}")]
    NameLength { len: usize },

    #[error("items must contain 1-10000 entries, got {len}")]
    ItemCount { len: usize },

    #[error("item {index} input must be 1-100000 bytes, got {len}")]
    ItemInputSize { index: usize, len: usize },

    #[error("phases must contain 1-10 entries, got {len}")]
    PhaseCount { len: usize },

    #[error("phase {index} name must be non-empty")]
    EmptyPhaseName { index: usize },

    #[error("phase {index} validation.min_score must be in [0,10], got {value}")]
    MinScoreRange { index: usize, value: f64 },

    #[error("options.concurrency must be in [1,50], got {value}")]
    ConcurrencyRange { value: u32 },

    #[error("options.checkpoint_frequency must be in [1,100], got {value}")]
    CheckpointFrequencyRange { value: u32 },

    #[error("list limit must be in [1,100], got {value}")]
    LimitRange { value: u32 },

    #[error("cleanup_checkpoints.older_than_days must be in [1,365], got {value}")]
    OlderThanDaysRange { value: u32 },
}

/// Errors surfaced when a control operation is attempted from a job status
/// that forbids it.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum IllegalStateError {
    #[error("job {job_id} cannot be resumed from status {status:?}")]
    CannotResume { job_id: String, status: JobStatus },

    #[error("job {job_id} cannot be paused from status {status:?}")]
    CannotPause { job_id: String, status: JobStatus },

    #[error("job {job_id} cannot be cancelled from status {status:?}")]
    CannotCancel { job_id: String, status: JobStatus },

    #[error("job {job_id} cannot be deleted while RUNNING")]
    CannotDeleteRunning { job_id: String },

    #[error("job {job_id} cannot be started from status {status:?}")]
    CannotStart { job_id: String, status: JobStatus },
}

/// Raised when an engine tunable falls outside its accepted range at
/// configuration-load time. Rejected outright rather than clamped, so a
/// typo in a TOML file or an env var surfaces immediately instead of as a
/// silently-degraded default.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("engine.chunk_size must be in [1,10000], got {value}")]
    ChunkSizeRange { value: usize },

    #[error("engine.item_timeout_secs must be in [1,3600], got {value}")]
    ItemTimeoutRange { value: u64 },

    #[error("engine.reconciliation_interval_items must be in [1,10000], got {value}")]
    ReconciliationIntervalRange { value: u64 },

    #[error("engine.retry_base_delay_ms must be in [0,60000], got {value}")]
    RetryBaseDelayRange { value: u64 },

    #[error("engine.checkpoint_time_interval_secs must be in [1,86400], got {value}")]
    CheckpointTimeIntervalRange { value: u64 },
}

/// An operation referenced a job id that does not exist.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[error("job {job_id} not found")]
pub struct NotFoundError {
    pub job_id: String,
}

/// Fatal errors raised outside a per-item task (e.g. repository failures
/// during a phase header update). These transition the job to FAILED; the
/// checkpoint is retained. Never raised for per-item processing failures,
/// which are captured as `JobError` records instead (see `model::JobError`).
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("repository error: {0}")]
    Repository(#[source] anyhow::Error),

    #[error("checkpoint store error: {0}")]
    Checkpoint(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Top-level error returned by every Job Manager and Batch Executor
/// operation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    IllegalState(#[from] IllegalStateError),

    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Execution(ExecutionError::Other(err))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_carries_offending_value() {
        let err = ValidationError::ConcurrencyRange { value: 51 };
        assert!(err.to_string().contains("51"));
    }

    #[test]
    fn illegal_state_error_carries_job_id_and_status() {
        let err = IllegalStateError::CannotPause {
            job_id: "job-1".into(),
            status: JobStatus::Completed,
        };
        assert!(err.to_string().contains("job-1"));
        assert!(err.to_string().contains("Completed"));
    }

    #[test]
    fn not_found_error_is_matchable() {
        let err = NotFoundError {
            job_id: "missing".into(),
        };
        assert_eq!(err.job_id, "missing");
    }

    #[test]
    fn engine_error_converts_from_each_tier() {
        let v: EngineError = ValidationError::ItemCount { len: 0 }.into();
        assert!(matches!(v, EngineError::Validation(_)));

        let s: EngineError = IllegalStateError::CannotStart {
            job_id: "j".into(),
            status: JobStatus::Running,
        }
        .into();
        assert!(matches!(s, EngineError::IllegalState(_)));

        let n: EngineError = NotFoundError { job_id: "j".into() }.into();
        assert!(matches!(n, EngineError::NotFound(_)));

        let e: EngineError = anyhow::anyhow!("boom").into();
        assert!(matches!(e, EngineError::Execution(_)));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ValidationError::ItemCount { len: 0 });
        assert_std_error(&IllegalStateError::CannotDeleteRunning { job_id: "j".into() });
        assert_std_error(&NotFoundError { job_id: "j".into() });
        assert_std_error(&ExecutionError::Other(anyhow::anyhow!("x")));
        assert_std_error(&ConfigError::ChunkSizeRange { value: 0 });
    }

    #[test]
    fn config_error_carries_offending_value() {
        let err = ConfigError::RetryBaseDelayRange { value: 70_000 };
        assert!(err.to_string().contains("70000"));
    }
}
