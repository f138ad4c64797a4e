//! Checkpoint Store — durable resumable state for a job.
//!
//! A thin module over the job row's checkpoint column: one struct, a
//! handful of narrow operations, no business logic beyond the checkpoint
//! predicate itself.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::model::{CheckpointSnapshot, JobStatus};
use crate::repository::Repository;

/// Bookkeeping the Batch Executor carries across a phase to evaluate the
/// checkpoint predicate without re-reading the database.
#[derive(Debug, Clone)]
pub struct CheckpointCadence {
    pub frequency: u32,
    pub last_checkpoint_index: i64,
    pub last_checkpoint_at: Instant,
    pub time_interval: Duration,
}

impl CheckpointCadence {
    pub fn new(frequency: u32, time_interval: Duration) -> Self {
        Self {
            frequency,
            last_checkpoint_index: -1,
            last_checkpoint_at: Instant::now(),
            time_interval,
        }
    }

    /// Evaluates the two-clause predicate: count-based or time-based,
    /// whichever fires first.
    pub fn should_checkpoint(&self, last_completed_item_index: i64) -> bool {
        let count_fires = last_completed_item_index > 0
            && last_completed_item_index % self.frequency as i64 == 0
            && last_completed_item_index != self.last_checkpoint_index;
        let time_fires = self.last_checkpoint_at.elapsed() >= self.time_interval;
        count_fires || time_fires
    }

    pub fn record_checkpoint(&mut self, last_completed_item_index: i64) {
        self.last_checkpoint_index = last_completed_item_index;
        self.last_checkpoint_at = Instant::now();
    }
}

/// Durable checkpoint operations, delegating storage to the Repository.
#[derive(Clone)]
pub struct CheckpointStore {
    repository: Repository,
}

impl CheckpointStore {
    pub fn new(repository: Repository) -> Self {
        Self { repository }
    }

    pub async fn save(&self, job_id: &str, snapshot: &CheckpointSnapshot) -> anyhow::Result<()> {
        let mut snapshot = snapshot.clone();
        snapshot.timestamp = Utc::now();
        self.repository.save_checkpoint(job_id, &snapshot).await
    }

    pub async fn load(&self, job_id: &str) -> anyhow::Result<Option<CheckpointSnapshot>> {
        self.repository.load_checkpoint(job_id).await
    }

    pub async fn clear(&self, job_id: &str) -> anyhow::Result<()> {
        self.repository.clear_checkpoint(job_id).await
    }

    pub async fn has(&self, job_id: &str) -> anyhow::Result<bool> {
        Ok(self.load(job_id).await?.is_some())
    }

    /// Applies the `cadence` predicate and saves when it fires, returning
    /// whether a save occurred.
    pub async fn auto_checkpoint(
        &self,
        job_id: &str,
        snapshot: &CheckpointSnapshot,
        cadence: &mut CheckpointCadence,
    ) -> anyhow::Result<bool> {
        if cadence.should_checkpoint(snapshot.last_completed_item_index) {
            self.save(job_id, snapshot).await?;
            cadence.record_checkpoint(snapshot.last_completed_item_index);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Bulk cleanup: nulls checkpoints on terminal jobs older than
    /// `older_than_days`, optionally restricted to one status.
    pub async fn cleanup_older_than(&self, older_than_days: u32, status: Option<JobStatus>) -> anyhow::Result<u64> {
        let cutoff: DateTime<Utc> = Utc::now() - chrono::Duration::days(older_than_days as i64);
        self.repository.cleanup_checkpoints_older_than(cutoff, status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobDefinition;

    fn definition() -> JobDefinition {
        JobDefinition {
            name: "n".into(),
            group_id: None,
            user_id: None,
            items: vec![crate::model::ItemInput { input: "a".into(), metadata: None }],
            phases: vec![crate::model::PhaseConfig::new("p")],
            options: Default::default(),
        }
    }

    #[test]
    fn cadence_fires_on_count_boundary_only_once() {
        let mut cadence = CheckpointCadence::new(10, Duration::from_secs(3600));
        assert!(!cadence.should_checkpoint(5));
        assert!(cadence.should_checkpoint(10));
        cadence.record_checkpoint(10);
        assert!(!cadence.should_checkpoint(10));
        assert!(cadence.should_checkpoint(20));
    }

    #[test]
    fn cadence_fires_on_time_elapsed() {
        let cadence = CheckpointCadence::new(10, Duration::from_millis(0));
        // any nonzero elapsed time satisfies a zero interval
        assert!(cadence.should_checkpoint(3));
    }

    #[tokio::test]
    async fn save_load_clear_has_round_trip() {
        let repo = Repository::open_in_memory().unwrap();
        repo.create_job("job-1", &definition()).await.unwrap();
        let store = CheckpointStore::new(repo);

        assert!(!store.has("job-1").await.unwrap());
        store.save("job-1", &CheckpointSnapshot::new(1)).await.unwrap();
        assert!(store.has("job-1").await.unwrap());
        store.clear("job-1").await.unwrap();
        assert!(!store.has("job-1").await.unwrap());
    }

    #[tokio::test]
    async fn auto_checkpoint_saves_only_when_predicate_fires() {
        let repo = Repository::open_in_memory().unwrap();
        repo.create_job("job-1", &definition()).await.unwrap();
        let store = CheckpointStore::new(repo);
        let mut cadence = CheckpointCadence::new(10, Duration::from_secs(3600));

        let mut snapshot = CheckpointSnapshot::new(1);
        snapshot.last_completed_item_index = 5;
        assert!(!store.auto_checkpoint("job-1", &snapshot, &mut cadence).await.unwrap());

        snapshot.last_completed_item_index = 10;
        assert!(store.auto_checkpoint("job-1", &snapshot, &mut cadence).await.unwrap());
        assert!(store.has("job-1").await.unwrap());
    }
}
