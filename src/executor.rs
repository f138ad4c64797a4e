//! Batch Executor — runs a single job to quiescence, phase by phase.
//!
//! This is the engine's largest component:
//! per-phase scheduling, bounded concurrency, retries with backoff,
//! dead-lettering, per-item timeouts, cooperative cancellation, and
//! periodic analytics reconciliation. A `Semaphore`-gated spawn loop
//! collected via joined handles, run once per phase in strict sequential
//! order rather than as parallel waves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::checkpoint::{CheckpointCadence, CheckpointStore};
use crate::concurrency::BoundedConcurrency;
use crate::config::EngineConfig;
use crate::errors::{EngineResult, ExecutionError, NotFoundError};
use crate::model::{
    Accounting, CheckpointSnapshot, Item, ItemStatus, Job, JobError, JobStatus, PhaseConfig,
    PhaseProgress,
};
use crate::processor::{CancelSignal, ProcessingError, Processor};
use crate::repository::Repository;

/// The tagged sentinel carried out of the phase loop on PAUSED/CANCELLED
/// detection. Never surfaced as an `EngineError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Paused,
    Cancelled,
}

/// Outcome of running a job to completion or to a cooperative stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Stopped(StopReason),
}

enum ItemOutcome {
    Completed,
    DeadLettered,
    RetryDeferred,
    /// Already dead-lettered by an earlier phase; settled, so it still
    /// advances the contiguous-completed prefix, but contributes no new
    /// work in this phase.
    AlreadyTerminal,
    /// The job was paused/cancelled before this item's turn; unsettled, so
    /// it must NOT advance the prefix.
    Stopped,
}

pub struct BatchExecutor {
    repository: Repository,
    checkpoints: CheckpointStore,
    processor: Arc<dyn Processor>,
    config: EngineConfig,
}

impl BatchExecutor {
    pub fn new(
        repository: Repository,
        checkpoints: CheckpointStore,
        processor: Arc<dyn Processor>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repository,
            checkpoints,
            processor,
            config,
        }
    }

    /// Runs `job_id` to quiescence: COMPLETED, or a cooperative stop at
    /// PAUSED/CANCELLED. Fatal errors outside a per-item task propagate as
    /// `EngineError::Execution`; the caller (Job Manager's background task)
    /// is responsible for transitioning the job to FAILED.
    pub async fn run_job(&self, job_id: &str) -> EngineResult<RunOutcome> {
        let job = self
            .repository
            .get_job(job_id)
            .await
            .map_err(ExecutionError::Repository)?
            .ok_or_else(|| NotFoundError { job_id: job_id.to_string() })?;

        self.repository
            .mark_started(job_id)
            .await
            .map_err(ExecutionError::Repository)?;

        let checkpoint = self
            .checkpoints
            .load(job_id)
            .await
            .map_err(ExecutionError::Checkpoint)?;
        if checkpoint.is_none() {
            warn!(job_id, "resuming without a checkpoint; restarting from phase 0 item 0");
        }

        let mut completed_phases: Vec<String> =
            checkpoint.as_ref().map(|c| c.completed_phases.clone()).unwrap_or_default();
        let mut phase_progress: HashMap<String, PhaseProgress> =
            checkpoint.as_ref().map(|c| c.phase_progress.clone()).unwrap_or_default();

        for phase in &job.phases {
            // 1. Resume gate.
            if completed_phases.contains(&phase.name) {
                info!(job_id, phase = %phase.name, "skipping already-completed phase");
                continue;
            }

            // 2. Cooperative cancel gate.
            if let Some(stop) = self.check_stopped(job_id).await? {
                return Ok(RunOutcome::Stopped(stop));
            }

            // 3. Phase header.
            self.repository
                .set_current_phase(job_id, &phase.name)
                .await
                .map_err(ExecutionError::Repository)?;
            info!(job_id, phase = %phase.name, "starting phase");

            // 4. Resumption point.
            let start_index = phase_progress
                .get(&phase.name)
                .map(|p| p.last_completed_index)
                .unwrap_or(-1);

            let is_first_phase = job.phases.first().map(|p| p.name == phase.name).unwrap_or(false);

            let outcome = self
                .run_phase(
                    job_id,
                    &job,
                    phase,
                    start_index,
                    is_first_phase,
                    &completed_phases,
                    &mut phase_progress,
                )
                .await?;

            if let Some(stop) = outcome {
                return Ok(RunOutcome::Stopped(stop));
            }

            completed_phases.push(phase.name.clone());
        }

        // End of job.
        self.repository
            .mark_completed(job_id, JobStatus::Completed)
            .await
            .map_err(ExecutionError::Repository)?;
        self.checkpoints.clear(job_id).await.map_err(ExecutionError::Checkpoint)?;
        info!(job_id, "job completed");
        Ok(RunOutcome::Completed)
    }

    async fn check_stopped(&self, job_id: &str) -> EngineResult<Option<StopReason>> {
        let job = self
            .repository
            .get_job(job_id)
            .await
            .map_err(ExecutionError::Repository)?
            .ok_or_else(|| NotFoundError { job_id: job_id.to_string() })?;
        Ok(match job.status {
            JobStatus::Paused => Some(StopReason::Paused),
            JobStatus::Cancelled => Some(StopReason::Cancelled),
            _ => None,
        })
    }

    /// Runs a single phase's work set to completion or to a cooperative
    /// stop. Returns `Some(reason)` if stopped mid-phase.
    #[allow(clippy::too_many_arguments)]
    async fn run_phase(
        &self,
        job_id: &str,
        job: &Job,
        phase: &PhaseConfig,
        start_index: i64,
        is_first_phase: bool,
        completed_phases: &[String],
        phase_progress: &mut HashMap<String, PhaseProgress>,
    ) -> EngineResult<Option<StopReason>> {
        let total_items = job.total_items as i64;
        let concurrency = BoundedConcurrency::new(job.options.concurrency as usize);
        let mut cadence = CheckpointCadence::new(job.options.checkpoint_frequency, self.config.checkpoint_time_interval);

        let mut contiguous_prefix = start_index;
        let mut phase_processed: u64 = 0;
        let mut phase_failed: u64 = 0;
        let mut items_since_sync: u64 = 0;

        let mut index = start_index + 1;
        while index < total_items {
            // 2b. Cooperative cancel gate, re-checked per chunk.
            if let Some(stop) = self.check_stopped(job_id).await? {
                return Ok(Some(stop));
            }

            let chunk_end = (index + self.config.chunk_size as i64).min(total_items);
            let chunk_indices: Vec<i64> = (index..chunk_end).collect();

            let mut handles = Vec::with_capacity(chunk_indices.len());
            for item_index in chunk_indices.iter().copied() {
                let repository = self.repository.clone();
                let processor = self.processor.clone();
                let concurrency = concurrency.clone();
                let job_id = job_id.to_string();
                let phase = phase.clone();
                let timeout = self.config.item_timeout;
                let retry_base_delay = self.config.retry_base_delay;

                handles.push(tokio::spawn(async move {
                    process_one_item(
                        repository,
                        processor,
                        concurrency,
                        job_id,
                        phase,
                        item_index as u32,
                        is_first_phase,
                        timeout,
                        retry_base_delay,
                    )
                    .await
                }));
            }

            // 7. Promise.allSettled-style join: every handle is awaited,
            // regardless of individual outcome, before moving to the next
            // chunk.
            let mut outcomes: Vec<(i64, ItemOutcome)> = Vec::with_capacity(handles.len());
            for (item_index, handle) in chunk_indices.iter().copied().zip(handles) {
                let outcome = match handle.await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(err)) => return Err(ExecutionError::Other(err).into()),
                    Err(join_err) => {
                        return Err(ExecutionError::Other(anyhow::anyhow!(
                            "item task panicked: {join_err}"
                        ))
                        .into());
                    }
                };
                outcomes.push((item_index, outcome));
            }

            for (item_index, outcome) in outcomes {
                items_since_sync += 1;
                match outcome {
                    ItemOutcome::Completed => {
                        phase_processed += 1;
                        if item_index == contiguous_prefix + 1 {
                            contiguous_prefix = item_index;
                        }
                    }
                    ItemOutcome::DeadLettered => {
                        phase_processed += 1;
                        phase_failed += 1;
                        if item_index == contiguous_prefix + 1 {
                            contiguous_prefix = item_index;
                        }
                    }
                    ItemOutcome::AlreadyTerminal => {
                        if item_index == contiguous_prefix + 1 {
                            contiguous_prefix = item_index;
                        }
                    }
                    ItemOutcome::RetryDeferred | ItemOutcome::Stopped => {
                        // leaves a gap: the contiguous-completed prefix
                        // cannot advance past this index, so a resume
                        // never skips an unsettled item.
                    }
                }

                if items_since_sync >= self.config.reconciliation_interval_items {
                    self.reconcile(job_id).await?;
                    items_since_sync = 0;
                }

                let mut progress = phase_progress.clone();
                progress.insert(
                    phase.name.clone(),
                    PhaseProgress {
                        last_completed_index: contiguous_prefix,
                        items_processed: phase_processed,
                        items_failed: phase_failed,
                    },
                );
                let counters = self.counters_snapshot(job_id).await?;
                let snapshot = CheckpointSnapshot {
                    timestamp: Utc::now(),
                    current_phase: phase.name.clone(),
                    completed_phases: completed_phases.to_vec(),
                    last_completed_item_index: contiguous_prefix,
                    total_items: job.total_items,
                    counters,
                    phase_progress: progress,
                };
                if self
                    .checkpoints
                    .auto_checkpoint(job_id, &snapshot, &mut cadence)
                    .await
                    .map_err(ExecutionError::Checkpoint)?
                {
                    *phase_progress = snapshot.phase_progress;
                }
            }

            // A retry-deferred or cooperatively-stopped item freezes the
            // contiguous prefix below this chunk; once the sweep reaches
            // the end of the phase with such a gap still open, restart it
            // from the gap rather than treating the phase as settled.
            index = if chunk_end >= total_items && contiguous_prefix + 1 < total_items {
                contiguous_prefix + 1
            } else {
                chunk_end
            };
        }

        // 8. End of phase: final reconciliation and a durable checkpoint
        // recording this phase as complete, so a crash before the next
        // phase's first checkpoint does not re-run this phase.
        self.reconcile(job_id).await?;
        let mut progress = phase_progress.clone();
        progress.insert(
            phase.name.clone(),
            PhaseProgress {
                last_completed_index: contiguous_prefix,
                items_processed: phase_processed,
                items_failed: phase_failed,
            },
        );
        let mut all_completed = completed_phases.to_vec();
        all_completed.push(phase.name.clone());
        let counters = self.counters_snapshot(job_id).await?;
        let snapshot = CheckpointSnapshot {
            timestamp: Utc::now(),
            current_phase: phase.name.clone(),
            completed_phases: all_completed,
            last_completed_item_index: contiguous_prefix,
            total_items: job.total_items,
            counters,
            phase_progress: progress.clone(),
        };
        self.checkpoints.save(job_id, &snapshot).await.map_err(ExecutionError::Checkpoint)?;
        *phase_progress = progress;
        info!(job_id, phase = %phase.name, processed = phase_processed, failed = phase_failed, "phase complete");

        Ok(None)
    }

    /// Analytics reconciliation: recomputes job-level
    /// aggregates from Item rows and replaces, never increments, them.
    async fn reconcile(&self, job_id: &str) -> EngineResult<()> {
        let items = self.repository.get_items(job_id).await.map_err(ExecutionError::Repository)?;
        let mut accounting = Accounting::default();
        let mut completed = 0u64;
        let mut failed = 0u64;
        for item in &items {
            accounting.add(item.accounting);
            match item.status {
                ItemStatus::Completed => completed += 1,
                ItemStatus::Failed => failed += 1,
                _ => {}
            }
        }
        self.repository
            .reconcile_counters(job_id, completed, failed, accounting.cost, accounting.tokens)
            .await
            .map_err(ExecutionError::Repository)?;
        Ok(())
    }

    async fn counters_snapshot(&self, job_id: &str) -> EngineResult<crate::model::CheckpointCounters> {
        let job = self
            .repository
            .get_job(job_id)
            .await
            .map_err(ExecutionError::Repository)?
            .ok_or_else(|| NotFoundError { job_id: job_id.to_string() })?;
        Ok(crate::model::CheckpointCounters {
            completed_items: job.completed_items,
            failed_items: job.failed_items,
            cost: job.accounting.cost,
            tokens: job.accounting.tokens,
        })
    }
}

/// The per-item task body. Runs under a permit
/// acquired from `concurrency`; returns the settled `ItemOutcome` so the
/// phase loop can update its checkpoint bookkeeping.
#[allow(clippy::too_many_arguments)]
async fn process_one_item(
    repository: Repository,
    processor: Arc<dyn Processor>,
    concurrency: BoundedConcurrency,
    job_id: String,
    phase: PhaseConfig,
    item_index: u32,
    is_first_phase: bool,
    timeout: Duration,
    retry_base_delay: Duration,
) -> anyhow::Result<ItemOutcome> {
    concurrency
        .with_permit(move || async move {
            // 6a. Re-read job status; if stopped, skip the item without mutating it.
            let job = repository
                .get_job(&job_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("job {job_id} disappeared mid-phase"))?;
            if matches!(job.status, JobStatus::Paused | JobStatus::Cancelled) {
                return Ok(ItemOutcome::Stopped);
            }

            let mut item = repository
                .get_item(&job_id, item_index)
                .await?
                .ok_or_else(|| anyhow::anyhow!("item {item_index} of job {job_id} not found"))?;

            // A dead-lettered item from an earlier phase carries no valid output
            // to feed forward; it is excluded from subsequent phases.
            if item.status == ItemStatus::Failed || item.phase_outputs.contains_key(&phase.name) {
                return Ok(ItemOutcome::AlreadyTerminal);
            }

            // 6b. Mark PROCESSING.
            item.status = ItemStatus::Processing;
            item.current_phase = Some(phase.name.clone());
            item.started_at = Some(Utc::now());
            repository.save_item(&item).await?;

            // 6c. Resolve the phase input.
            let input = if is_first_phase {
                item.input.clone()
            } else {
                item.output.clone().unwrap_or_default()
            };

            // 6d. Invoke the Processor under a per-item timeout.
            let cancel = CancelSignal::new();
            let started_at = item.started_at.unwrap();
            let result = tokio::time::timeout(timeout, processor.process(&input, &phase, &cancel)).await;

            match result {
                Ok(Ok(output)) => {
                    // 6e. Success.
                    item.status = ItemStatus::Completed;
                    item.output = Some(output.output.clone());
                    item.phase_outputs.insert(phase.name.clone(), output.output);
                    item.accounting.cost += output.cost;
                    item.accounting.tokens += output.tokens;
                    item.processing_time_ms = Some((Utc::now() - started_at).num_milliseconds().max(0) as u64);
                    item.completed_at = Some(Utc::now());
                    repository.save_item(&item).await?;
                    Ok(ItemOutcome::Completed)
                }
                Ok(Err(err)) => handle_failure(repository, item, phase, err.to_string(), retry_base_delay).await,
                Err(_elapsed) => {
                    cancel.cancel();
                    handle_failure(
                        repository,
                        item,
                        phase,
                        ProcessingError::Timeout(timeout).to_string(),
                        retry_base_delay,
                    )
                    .await
                }
            }
        })
        .await
}

/// Retry policy and dead-lettering. The delay before a
/// retry-deferred item becomes eligible again is `retry_base_delay *
/// backoff.factor(attempt)`.
async fn handle_failure(
    repository: Repository,
    mut item: Item,
    phase: PhaseConfig,
    error_message: String,
    retry_base_delay: Duration,
) -> anyhow::Result<ItemOutcome> {
    let r = item.retry_count;
    let max_retries = phase.retry.max_retries;

    if r < max_retries {
        let delay_ms = retry_base_delay.as_millis() as u64 * phase.retry.backoff.factor(r);
        item.errors.push(JobError {
            phase: phase.name.clone(),
            error: error_message,
            timestamp: Utc::now(),
            retry_attempt: Some(r + 1),
            dead_letter: false,
        });
        item.status = ItemStatus::Pending;
        item.retry_count += 1;
        item.current_phase = None;
        repository.save_item(&item).await?;
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Ok(ItemOutcome::RetryDeferred)
    } else {
        item.errors.push(JobError {
            phase: phase.name.clone(),
            error: error_message,
            timestamp: Utc::now(),
            retry_attempt: None,
            dead_letter: true,
        });
        item.status = ItemStatus::Failed;
        item.completed_at = Some(Utc::now());
        repository.save_item(&item).await?;
        Ok(ItemOutcome::DeadLettered)
    }
}
