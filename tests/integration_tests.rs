//! End-to-end tests driving `JobManager` and `Repository` the way an
//! external caller would, through the crate's public surface rather than
//! its internal modules.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use forgebatch::config::EngineConfig;
use forgebatch::model::{ItemInput, JobDefinition, JobOptions, PhaseConfig};
use forgebatch::{CancelSignal, JobManager, JobStatus, ProcessedOutput, Processor, ProcessingError, Repository};
use rust_decimal::Decimal;

/// Uppercases its input and counts invocations; used to assert a job
/// actually drove its items through the Processor rather than merely
/// persisting state.
struct CountingProcessor {
    calls: AtomicUsize,
}

impl CountingProcessor {
    fn new() -> Self {
        Self { calls: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl Processor for CountingProcessor {
    async fn process(
        &self,
        input: &str,
        phase: &PhaseConfig,
        _cancel: &CancelSignal,
    ) -> Result<ProcessedOutput, ProcessingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ProcessedOutput {
            output: format!("{}::{}", phase.name, input.to_uppercase()),
            cost: Decimal::new(1, 2),
            tokens: 10,
        })
    }
}

fn definition(name: &str, items: usize, phases: Vec<PhaseConfig>) -> JobDefinition {
    JobDefinition {
        name: name.to_string(),
        group_id: Some("grp-1".into()),
        user_id: Some("user-1".into()),
        items: (0..items)
            .map(|i| ItemInput { input: format!("item-{i}"), metadata: None })
            .collect(),
        phases,
        options: JobOptions { concurrency: 4, checkpoint_frequency: 5, auto_start: true },
    }
}

async fn wait_for_terminal(manager: &JobManager, job_id: &str) -> forgebatch::Job {
    for _ in 0..200 {
        let job = manager.get(job_id).await.unwrap();
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} did not reach a terminal state in time");
}

// S1 — Happy path: single phase, all items succeed.
#[tokio::test]
async fn submit_and_autostart_completes_a_single_phase_job() {
    let repository = Repository::open_in_memory().unwrap();
    let processor = Arc::new(CountingProcessor::new());
    let manager = JobManager::new(repository, processor.clone(), EngineConfig::default());

    let def = definition("greeting", 6, vec![PhaseConfig::new("shout")]);
    let job = manager.create("job-s1", def).await.unwrap();
    assert_eq!(job.name, "greeting");

    let job = wait_for_terminal(&manager, "job-s1").await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.completed_items, 6);
    assert_eq!(processor.calls.load(Ordering::SeqCst), 6);

    let results = manager.results("job-s1").await.unwrap();
    assert!(results.iter().all(|i| i.output.as_deref() == Some(&format!("shout::{}", i.input.to_uppercase()))));
}

// S2 — Multi-phase: output threads forward through three phases.
#[tokio::test]
async fn multi_phase_job_runs_phases_in_order() {
    let repository = Repository::open_in_memory().unwrap();
    let processor = Arc::new(CountingProcessor::new());
    let manager = JobManager::new(repository, processor, EngineConfig::default());

    let def = definition(
        "pipeline",
        4,
        vec![PhaseConfig::new("extract"), PhaseConfig::new("transform"), PhaseConfig::new("load")],
    );
    manager.create("job-s2", def).await.unwrap();
    let job = wait_for_terminal(&manager, "job-s2").await;
    assert_eq!(job.status, JobStatus::Completed);

    let analytics = manager.analytics("job-s2").await.unwrap();
    assert_eq!(analytics.phases.len(), 3);
    for phase in &analytics.phases {
        assert_eq!(phase.items_processed, 4);
        assert_eq!(phase.items_failed, 0);
    }
}

// Validation boundary: malformed submissions are rejected before any
// persistence happens.
#[tokio::test]
async fn create_rejects_a_job_with_no_items() {
    let repository = Repository::open_in_memory().unwrap();
    let processor = Arc::new(CountingProcessor::new());
    let manager = JobManager::new(repository, processor, EngineConfig::default());

    let mut def = definition("empty", 1, vec![PhaseConfig::new("only")]);
    def.items.clear();
    let err = manager.create("job-bad", def).await.unwrap_err();
    assert!(err.to_string().contains("items"));
}

// Pause/cancel control surface and state-machine guards.
#[tokio::test]
async fn pause_then_cancel_transitions_are_rejected_once_terminal() {
    let repository = Repository::open_in_memory().unwrap();
    let processor = Arc::new(CountingProcessor::new());
    let manager = JobManager::new(repository, processor, EngineConfig::default());

    let mut def = definition("not-started", 2, vec![PhaseConfig::new("only")]);
    def.options.auto_start = false;
    manager.create("job-s5", def).await.unwrap();

    // a PENDING job cannot be paused, but cancellation is permitted from
    // any non-terminal status, including PENDING.
    assert!(manager.pause("job-s5").await.is_err());
    manager.cancel("job-s5").await.unwrap();
    let job = manager.get("job-s5").await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.completed_at.is_some());

    let mut def2 = definition("not-started-2", 2, vec![PhaseConfig::new("only")]);
    def2.options.auto_start = false;
    manager.create("job-s5b", def2).await.unwrap();
    manager.start("job-s5b").await.unwrap();
    let job = wait_for_terminal(&manager, "job-s5b").await;
    assert_eq!(job.status, JobStatus::Completed);

    // a COMPLETED job is terminal; no further control transitions apply.
    assert!(manager.pause("job-s5b").await.is_err());
    assert!(manager.resume("job-s5b").await.is_err());
    assert!(manager.cancel("job-s5b").await.is_err());
}

// Listing and deletion across the public surface.
#[tokio::test]
async fn list_filters_by_status_and_delete_removes_terminal_jobs() {
    let repository = Repository::open_in_memory().unwrap();
    let processor = Arc::new(CountingProcessor::new());
    let manager = JobManager::new(repository, processor, EngineConfig::default());

    for i in 0..3 {
        let def = definition(&format!("job-{i}"), 1, vec![PhaseConfig::new("only")]);
        manager.create(&format!("job-list-{i}"), def).await.unwrap();
    }
    for i in 0..3 {
        wait_for_terminal(&manager, &format!("job-list-{i}")).await;
    }

    let page = manager
        .list(forgebatch::JobFilter {
            group_id: Some("grp-1".into()),
            user_id: None,
            status: Some(JobStatus::Completed),
            limit: 10,
            offset: 0,
        })
        .await
        .unwrap();
    assert_eq!(page.jobs.len(), 3);

    manager.delete("job-list-0").await.unwrap();
    assert!(manager.get("job-list-0").await.is_err());
}
