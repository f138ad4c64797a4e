//! Job Manager — the external surface of the engine.
//!
//! Validates submissions, drives the job state machine, and fires a
//! background `tokio::spawn` task per run that never propagates its
//! failure to the caller: it captures its `Result` internally and writes
//! the outcome back to the database rather than bubbling it up through
//! the call that started it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{error, info};

use crate::checkpoint::CheckpointStore;
use crate::config::{self, EngineConfig};
use crate::errors::{EngineError, EngineResult, IllegalStateError, NotFoundError, ValidationError};
use crate::executor::{BatchExecutor, RunOutcome};
use crate::model::{Accounting, Job, JobDefinition, JobStatus};
use crate::processor::Processor;
use crate::repository::{JobFilter, JobPage, Repository};

/// Cheap polling projection returned by `JobManager::status`: derived
/// progress fields alongside the counters and timestamps a caller would
/// otherwise have to compute itself from the full `Job`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusProjection {
    pub job_id: String,
    pub status: JobStatus,
    pub current_phase: Option<String>,
    pub total_items: u64,
    pub completed_items: u64,
    pub failed_items: u64,
    pub percent_complete: f64,
    pub estimated_time_remaining_ms: Option<u64>,
    pub accounting: Accounting,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Per-phase rollup within `JobAnalytics`. An item is attributed to a phase
/// once its `phaseOutputs` records an output for that phase — not by its
/// (single, overwritten-per-phase) `current_phase` field.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PhaseAnalytics {
    pub phase: String,
    pub items_processed: u64,
    pub items_failed: u64,
    pub cost: Decimal,
    pub tokens: u64,
    pub avg_processing_time_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct OverallAnalytics {
    pub total_items: u64,
    pub completed_items: u64,
    pub failed_items: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CostAnalytics {
    pub total: Decimal,
    pub per_item: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TokensAnalytics {
    pub total: u64,
    pub per_item: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PerformanceAnalytics {
    pub avg_processing_time_ms: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobAnalytics {
    pub job_id: String,
    pub overall: OverallAnalytics,
    pub cost: CostAnalytics,
    pub tokens: TokensAnalytics,
    pub performance: PerformanceAnalytics,
    pub phases: Vec<PhaseAnalytics>,
}

/// Validates a job submission against the engine's bounds, independent of
/// persistence, as a pure function rather than checks scattered through
/// the handler.
fn validate_definition(definition: &JobDefinition) -> Result<(), ValidationError> {
    if definition.name.is_empty() || definition.name.len() > 200 {
        return Err(ValidationError::NameLength { len: definition.name.len() });
    }
    if definition.items.is_empty() || definition.items.len() > 10_000 {
        return Err(ValidationError::ItemCount { len: definition.items.len() });
    }
    for (index, item) in definition.items.iter().enumerate() {
        if item.input.is_empty() || item.input.len() > 100_000 {
            return Err(ValidationError::ItemInputSize { index, len: item.input.len() });
        }
    }
    if definition.phases.is_empty() || definition.phases.len() > 10 {
        return Err(ValidationError::PhaseCount { len: definition.phases.len() });
    }
    for (index, phase) in definition.phases.iter().enumerate() {
        if phase.name.is_empty() {
            return Err(ValidationError::EmptyPhaseName { index });
        }
        if let Some(validation) = &phase.validation
            && !(0.0..=10.0).contains(&validation.min_score)
        {
            return Err(ValidationError::MinScoreRange { index, value: validation.min_score });
        }
    }
    config::validate_concurrency(definition.options.concurrency)?;
    config::validate_checkpoint_frequency(definition.options.checkpoint_frequency)?;
    Ok(())
}

/// Orchestrates job submission and control operations; delegates actual
/// phase execution to `BatchExecutor`.
#[derive(Clone)]
pub struct JobManager {
    repository: Repository,
    checkpoints: CheckpointStore,
    processor: Arc<dyn Processor>,
    config: EngineConfig,
}

impl JobManager {
    pub fn new(repository: Repository, processor: Arc<dyn Processor>, config: EngineConfig) -> Self {
        let checkpoints = CheckpointStore::new(repository.clone());
        Self { repository, checkpoints, processor, config }
    }

    fn executor(&self) -> BatchExecutor {
        BatchExecutor::new(
            self.repository.clone(),
            self.checkpoints.clone(),
            self.processor.clone(),
            self.config,
        )
    }

    /// Validates and persists a new job.
    /// Autostarts it when `options.auto_start` is true (the default).
    pub async fn create(&self, id: &str, definition: JobDefinition) -> EngineResult<Job> {
        validate_definition(&definition)?;
        let job = self
            .repository
            .create_job(id, &definition)
            .await
            .map_err(EngineError::from)?;
        info!(job_id = %job.id, items = job.total_items, "job created");

        if definition.options.auto_start {
            self.start(&job.id).await?;
        }
        self.get(&job.id).await
    }

    /// Fetches a job by id.
    pub async fn get(&self, job_id: &str) -> EngineResult<Job> {
        self.repository
            .get_job(job_id)
            .await
            .map_err(EngineError::from)?
            .ok_or_else(|| NotFoundError { job_id: job_id.to_string() }.into())
    }

    /// Lists jobs with optional filters and pagination.
    pub async fn list(&self, filter: JobFilter) -> EngineResult<JobPage> {
        config::validate_list_limit(filter.limit)?;
        self.repository.list_jobs(&filter).await.map_err(EngineError::from)
    }

    /// Returns the completed output for every item in a job.
    pub async fn results(&self, job_id: &str) -> EngineResult<Vec<crate::model::Item>> {
        self.get(job_id).await?;
        self.repository.get_items(job_id).await.map_err(EngineError::from)
    }

    /// Cheap polling projection: percentComplete and a linear
    /// estimated-time-remaining projection, alongside progress counters,
    /// accounting, timestamps, and the job's last error.
    pub async fn status(&self, job_id: &str) -> EngineResult<StatusProjection> {
        let job = self.get(job_id).await?;
        let now = Utc::now();
        Ok(StatusProjection {
            job_id: job.id.clone(),
            status: job.status,
            current_phase: job.current_phase.clone(),
            total_items: job.total_items,
            completed_items: job.completed_items,
            failed_items: job.failed_items,
            percent_complete: job.percent_complete(),
            estimated_time_remaining_ms: job.estimated_time_remaining_ms(now),
            accounting: job.accounting,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            error: job.error.clone(),
        })
    }

    /// Cost/token/outcome rollup for a job, overall and per phase.
    pub async fn analytics(&self, job_id: &str) -> EngineResult<JobAnalytics> {
        let job = self.get(job_id).await?;
        let items = self.repository.get_items(job_id).await.map_err(EngineError::from)?;

        let mut phases: Vec<PhaseAnalytics> = job
            .phases
            .iter()
            .map(|p| PhaseAnalytics { phase: p.name.clone(), ..Default::default() })
            .collect();

        // items_failed is keyed by the phase recorded on the dead-letter
        // error itself, not by phaseOutputs membership.
        for item in &items {
            for error in &item.errors {
                if error.dead_letter
                    && let Some(entry) = phases.iter_mut().find(|p| p.phase == error.phase)
                {
                    entry.items_failed += 1;
                }
            }
        }

        // An item belongs to a phase's completed set once phaseOutputs
        // records an output for it, regardless of which phase it is
        // currently on (current_phase is overwritten on every phase
        // invocation and reflects only the most recent one).
        for entry in &mut phases {
            let mut processed = 0u64;
            let mut cost = Decimal::ZERO;
            let mut tokens = 0u64;
            let mut total_ms = 0u64;
            let mut timed_count = 0u64;
            for item in items.iter().filter(|i| i.phase_outputs.contains_key(&entry.phase)) {
                processed += 1;
                cost += item.accounting.cost;
                tokens += item.accounting.tokens;
                if let Some(ms) = item.processing_time_ms {
                    total_ms += ms;
                    timed_count += 1;
                }
            }
            entry.items_processed = processed;
            entry.cost = cost;
            entry.tokens = tokens;
            entry.avg_processing_time_ms =
                if timed_count == 0 { 0.0 } else { total_ms as f64 / timed_count as f64 };
        }

        let completed_items = job.completed_items;
        let success_rate =
            if job.total_items == 0 { 0.0 } else { completed_items as f64 / job.total_items as f64 };
        let cost_per_item =
            if completed_items == 0 { Decimal::ZERO } else { job.accounting.cost / Decimal::from(completed_items) };
        let tokens_per_item =
            if completed_items == 0 { 0.0 } else { job.accounting.tokens as f64 / completed_items as f64 };
        let avg_processing_time_ms = if completed_items == 0 {
            0.0
        } else {
            items.iter().filter_map(|i| i.processing_time_ms).sum::<u64>() as f64 / completed_items as f64
        };

        Ok(JobAnalytics {
            job_id: job.id,
            overall: OverallAnalytics {
                total_items: job.total_items,
                completed_items,
                failed_items: job.failed_items,
                success_rate,
            },
            cost: CostAnalytics { total: job.accounting.cost, per_item: cost_per_item },
            tokens: TokensAnalytics { total: job.accounting.tokens, per_item: tokens_per_item },
            performance: PerformanceAnalytics { avg_processing_time_ms },
            phases,
        })
    }

    /// Transitions a PENDING job to RUNNING and spawns its execution task.
    /// The spawned task's failure is captured and written back as
    /// `Job.status = FAILED`; it is never propagated to the caller of
    /// `start`.
    pub async fn start(&self, job_id: &str) -> EngineResult<()> {
        let job = self.get(job_id).await?;
        if job.status != JobStatus::Pending {
            return Err(IllegalStateError::CannotStart { job_id: job_id.to_string(), status: job.status }.into());
        }
        self.spawn_run(job_id);
        Ok(())
    }

    /// Resumes a PAUSED or FAILED job from its last checkpoint.
    pub async fn resume(&self, job_id: &str) -> EngineResult<()> {
        let job = self.get(job_id).await?;
        if !job.status.is_resumable() {
            return Err(IllegalStateError::CannotResume { job_id: job_id.to_string(), status: job.status }.into());
        }
        self.repository
            .update_job_status(job_id, JobStatus::Running, None)
            .await
            .map_err(EngineError::from)?;
        self.spawn_run(job_id);
        Ok(())
    }

    /// Requests a cooperative pause. Only RUNNING jobs may be paused; the
    /// running Batch Executor observes the status flip at its next
    /// cancel-gate check and stops without completing the phase.
    pub async fn pause(&self, job_id: &str) -> EngineResult<()> {
        let job = self.get(job_id).await?;
        if job.status != JobStatus::Running {
            return Err(IllegalStateError::CannotPause { job_id: job_id.to_string(), status: job.status }.into());
        }
        self.repository
            .update_job_status(job_id, JobStatus::Paused, None)
            .await
            .map_err(EngineError::from)
    }

    /// Requests cooperative cancellation. Permitted from any status except
    /// the terminal COMPLETED/CANCELLED themselves — including PENDING
    /// (never started) and FAILED; a running Executor observes the status
    /// flip at its next cancel-gate check, and the checkpoint is retained
    /// for inspection but the job is terminal.
    pub async fn cancel(&self, job_id: &str) -> EngineResult<()> {
        let job = self.get(job_id).await?;
        if matches!(job.status, JobStatus::Completed | JobStatus::Cancelled) {
            return Err(IllegalStateError::CannotCancel { job_id: job_id.to_string(), status: job.status }.into());
        }
        self.repository
            .update_job_status(job_id, JobStatus::Cancelled, None)
            .await
            .map_err(EngineError::from)
    }

    /// Deletes a job and its items.
    /// Forbidden while RUNNING, since a background task may still be
    /// writing item rows.
    pub async fn delete(&self, job_id: &str) -> EngineResult<()> {
        let job = self.get(job_id).await?;
        if job.status == JobStatus::Running {
            return Err(IllegalStateError::CannotDeleteRunning { job_id: job_id.to_string() }.into());
        }
        self.repository.delete_job(job_id).await.map_err(EngineError::from)?;
        Ok(())
    }

    /// Bulk checkpoint cleanup.
    pub async fn cleanup_checkpoints(&self, older_than_days: u32, status: Option<JobStatus>) -> EngineResult<u64> {
        config::validate_older_than_days(older_than_days)?;
        self.checkpoints.cleanup_older_than(older_than_days, status).await.map_err(EngineError::from)
    }

    fn spawn_run(&self, job_id: &str) {
        let executor = self.executor();
        let repository = self.repository.clone();
        let job_id = job_id.to_string();

        tokio::spawn(async move {
            match executor.run_job(&job_id).await {
                Ok(RunOutcome::Completed) => {
                    info!(job_id = %job_id, "job run finished");
                }
                Ok(RunOutcome::Stopped(reason)) => {
                    info!(job_id = %job_id, ?reason, "job run stopped cooperatively");
                }
                Err(err) => {
                    error!(job_id = %job_id, error = %err, "job run failed");
                    let _ = repository
                        .update_job_status(&job_id, JobStatus::Failed, Some(&format!("{err:#}")))
                        .await;
                    let _ = repository
                        .mark_completed(&job_id, JobStatus::Failed)
                        .await;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ItemInput, JobOptions, PhaseConfig};
    use crate::processor::test_support::ScriptedProcessor;

    fn manager() -> JobManager {
        let repo = Repository::open_in_memory().unwrap();
        JobManager::new(repo, Arc::new(ScriptedProcessor::new()), EngineConfig::default())
    }

    fn definition(auto_start: bool) -> JobDefinition {
        JobDefinition {
            name: "job".into(),
            group_id: None,
            user_id: None,
            items: vec![
                ItemInput { input: "a".into(), metadata: None },
                ItemInput { input: "b".into(), metadata: None },
            ],
            phases: vec![PhaseConfig::new("only")],
            options: JobOptions { auto_start, ..Default::default() },
        }
    }

    #[tokio::test]
    async fn create_rejects_empty_name() {
        let manager = manager();
        let mut def = definition(false);
        def.name = String::new();
        let err = manager.create("job-1", def).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::NameLength { .. })));
    }

    #[tokio::test]
    async fn create_rejects_out_of_range_concurrency() {
        let manager = manager();
        let mut def = definition(false);
        def.options.concurrency = 0;
        let err = manager.create("job-1", def).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::ConcurrencyRange { .. })));
    }

    #[tokio::test]
    async fn create_without_autostart_leaves_job_pending() {
        let manager = manager();
        let job = manager.create("job-1", definition(false)).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn create_with_autostart_eventually_completes() {
        let manager = manager();
        manager.create("job-1", definition(true)).await.unwrap();
        // the run is spawned in the background; give it a moment to finish.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let job = manager.get("job-1").await.unwrap();
        assert!(matches!(job.status, JobStatus::Completed | JobStatus::Running));
    }

    #[tokio::test]
    async fn pause_rejected_unless_running() {
        let manager = manager();
        manager.create("job-1", definition(false)).await.unwrap();
        let err = manager.pause("job-1").await.unwrap_err();
        assert!(matches!(err, EngineError::IllegalState(IllegalStateError::CannotPause { .. })));
    }

    #[tokio::test]
    async fn delete_rejected_while_running() {
        let manager = manager();
        manager.create("job-1", definition(false)).await.unwrap();
        manager
            .repository
            .update_job_status("job-1", JobStatus::Running, None)
            .await
            .unwrap();
        let err = manager.delete("job-1").await.unwrap_err();
        assert!(matches!(err, EngineError::IllegalState(IllegalStateError::CannotDeleteRunning { .. })));
    }

    #[tokio::test]
    async fn delete_succeeds_for_pending_job() {
        let manager = manager();
        manager.create("job-1", definition(false)).await.unwrap();
        manager.delete("job-1").await.unwrap();
        let err = manager.get("job-1").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn resume_rejected_for_pending_job() {
        let manager = manager();
        manager.create("job-1", definition(false)).await.unwrap();
        let err = manager.resume("job-1").await.unwrap_err();
        assert!(matches!(err, EngineError::IllegalState(IllegalStateError::CannotResume { .. })));
    }

    #[tokio::test]
    async fn cleanup_checkpoints_rejects_out_of_range_days() {
        let manager = manager();
        let err = manager.cleanup_checkpoints(0, None).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(ValidationError::OlderThanDaysRange { .. })));
    }

    #[tokio::test]
    async fn cancel_permitted_from_pending_and_sets_completed_at() {
        let manager = manager();
        manager.create("job-1", definition(false)).await.unwrap();
        manager.cancel("job-1").await.unwrap();
        let job = manager.get("job-1").await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn cancel_permitted_from_failed() {
        let manager = manager();
        manager.create("job-1", definition(false)).await.unwrap();
        manager.repository.update_job_status("job-1", JobStatus::Failed, None).await.unwrap();
        manager.cancel("job-1").await.unwrap();
        let job = manager.get("job-1").await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_rejected_once_terminal() {
        let manager = manager();
        manager.create("job-1", definition(false)).await.unwrap();
        manager.cancel("job-1").await.unwrap();
        let err = manager.cancel("job-1").await.unwrap_err();
        assert!(matches!(err, EngineError::IllegalState(IllegalStateError::CannotCancel { .. })));
    }

    #[tokio::test]
    async fn status_reports_percent_complete_and_progress() {
        let manager = manager();
        manager.create("job-1", definition(true)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let status = manager.status("job-1").await.unwrap();
        assert_eq!(status.total_items, 2);
        if status.status == JobStatus::Completed {
            assert_eq!(status.percent_complete, 100.0);
        }
    }

    #[tokio::test]
    async fn analytics_attributes_every_phase_in_a_multi_phase_job() {
        let manager = manager();
        let def = JobDefinition {
            name: "job".into(),
            group_id: None,
            user_id: None,
            items: vec![
                ItemInput { input: "a".into(), metadata: None },
                ItemInput { input: "b".into(), metadata: None },
            ],
            phases: vec![PhaseConfig::new("extract"), PhaseConfig::new("transform")],
            options: JobOptions { auto_start: true, ..Default::default() },
        };
        manager.create("job-1", def).await.unwrap();
        for _ in 0..50 {
            if manager.get("job-1").await.unwrap().status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let analytics = manager.analytics("job-1").await.unwrap();
        assert_eq!(analytics.phases.len(), 2);
        for phase in &analytics.phases {
            assert_eq!(phase.items_processed, 2, "phase {} should see every item", phase.phase);
        }
        assert_eq!(analytics.overall.total_items, 2);
    }
}
