//! Typed access to persisted job/item state, backed by SQLite.
//!
//! A single connection wrapped in `run_migrations` with
//! `CREATE TABLE IF NOT EXISTS`, `params!`-driven CRUD, and `row.get(n)`
//! mapping into domain structs. Exposed as a cloneable, `Arc<Mutex<_>>`-
//! backed handle so the Job Manager and Batch Executor can share one
//! connection across concurrent item tasks.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::model::{
    Accounting, CheckpointSnapshot, Item, ItemStatus, Job, JobDefinition, JobOptions,
    JobStatus, PhaseConfig,
};

/// Filter + pagination for `Repository::list_jobs`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub group_id: Option<String>,
    pub user_id: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: u32,
    pub offset: u32,
}

/// A page of jobs plus whether more pages remain.
#[derive(Debug, Clone)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub has_more: bool,
}

fn json_col<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("failed to serialize column to JSON")
}

fn from_json_col<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).context("failed to deserialize JSON column")
}

fn decimal_to_col(d: &Decimal) -> String {
    d.to_string()
}

fn decimal_from_col(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).context("failed to parse decimal column")
}

struct Inner {
    conn: Connection,
}

impl Inner {
    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                PRAGMA foreign_keys = ON;

                CREATE TABLE IF NOT EXISTS job (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    group_id TEXT,
                    user_id TEXT,
                    status TEXT NOT NULL,
                    phases TEXT NOT NULL,
                    options TEXT NOT NULL,
                    total_items INTEGER NOT NULL DEFAULT 0,
                    completed_items INTEGER NOT NULL DEFAULT 0,
                    failed_items INTEGER NOT NULL DEFAULT 0,
                    cost TEXT NOT NULL DEFAULT '0',
                    tokens INTEGER NOT NULL DEFAULT 0,
                    current_phase TEXT,
                    checkpoint TEXT,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT,
                    updated_at TEXT NOT NULL,
                    error TEXT
                );

                CREATE TABLE IF NOT EXISTS item (
                    job_id TEXT NOT NULL REFERENCES job(id) ON DELETE CASCADE,
                    item_index INTEGER NOT NULL,
                    input TEXT NOT NULL,
                    metadata TEXT,
                    output TEXT,
                    phase_outputs TEXT NOT NULL DEFAULT '{}',
                    status TEXT NOT NULL,
                    current_phase TEXT,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    errors TEXT NOT NULL DEFAULT '[]',
                    cost TEXT NOT NULL DEFAULT '0',
                    tokens INTEGER NOT NULL DEFAULT 0,
                    processing_time_ms INTEGER,
                    started_at TEXT,
                    completed_at TEXT,
                    PRIMARY KEY (job_id, item_index)
                );

                CREATE INDEX IF NOT EXISTS idx_item_job ON item(job_id);
                ",
            )
            .context("failed to run repository migrations")?;
        Ok(())
    }

    fn job_from_row(row: &Row) -> rusqlite::Result<RawJob> {
        Ok(RawJob {
            id: row.get(0)?,
            name: row.get(1)?,
            group_id: row.get(2)?,
            user_id: row.get(3)?,
            status: row.get(4)?,
            phases: row.get(5)?,
            options: row.get(6)?,
            total_items: row.get(7)?,
            completed_items: row.get(8)?,
            failed_items: row.get(9)?,
            cost: row.get(10)?,
            tokens: row.get(11)?,
            current_phase: row.get(12)?,
            checkpoint: row.get(13)?,
            created_at: row.get(14)?,
            started_at: row.get(15)?,
            completed_at: row.get(16)?,
            updated_at: row.get(17)?,
            error: row.get(18)?,
        })
    }

    fn item_from_row(row: &Row) -> rusqlite::Result<RawItem> {
        Ok(RawItem {
            job_id: row.get(0)?,
            item_index: row.get(1)?,
            input: row.get(2)?,
            metadata: row.get(3)?,
            output: row.get(4)?,
            phase_outputs: row.get(5)?,
            status: row.get(6)?,
            current_phase: row.get(7)?,
            retry_count: row.get(8)?,
            errors: row.get(9)?,
            cost: row.get(10)?,
            tokens: row.get(11)?,
            processing_time_ms: row.get(12)?,
            started_at: row.get(13)?,
            completed_at: row.get(14)?,
        })
    }
}

/// Raw column tuple before decoding JSON/decimal/enum columns, matching the
/// teacher's `IssueRow`/`PipelineRunRow` intermediate structs in `db.rs`.
struct RawJob {
    id: String,
    name: String,
    group_id: Option<String>,
    user_id: Option<String>,
    status: String,
    phases: String,
    options: String,
    total_items: i64,
    completed_items: i64,
    failed_items: i64,
    cost: String,
    tokens: i64,
    current_phase: Option<String>,
    checkpoint: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    updated_at: String,
    error: Option<String>,
}

impl RawJob {
    fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: self.id,
            name: self.name,
            group_id: self.group_id,
            user_id: self.user_id,
            status: JobStatus::from_str(&self.status).map_err(anyhow::Error::msg)?,
            phases: from_json_col::<Vec<PhaseConfig>>(&self.phases)?,
            options: from_json_col::<JobOptions>(&self.options)?,
            total_items: self.total_items as u64,
            completed_items: self.completed_items as u64,
            failed_items: self.failed_items as u64,
            accounting: Accounting {
                cost: decimal_from_col(&self.cost)?,
                tokens: self.tokens as u64,
            },
            current_phase: self.current_phase,
            checkpoint: self
                .checkpoint
                .as_deref()
                .map(from_json_col::<CheckpointSnapshot>)
                .transpose()?,
            created_at: parse_ts(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            updated_at: parse_ts(&self.updated_at)?,
            error: self.error,
        })
    }
}

struct RawItem {
    job_id: String,
    item_index: i64,
    input: String,
    metadata: Option<String>,
    output: Option<String>,
    phase_outputs: String,
    status: String,
    current_phase: Option<String>,
    retry_count: i64,
    errors: String,
    cost: String,
    tokens: i64,
    processing_time_ms: Option<i64>,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl RawItem {
    fn into_item(self) -> Result<Item> {
        Ok(Item {
            job_id: self.job_id,
            item_index: self.item_index as u32,
            input: self.input,
            metadata: self
                .metadata
                .as_deref()
                .map(from_json_col::<HashMap<String, String>>)
                .transpose()?,
            output: self.output,
            phase_outputs: from_json_col(&self.phase_outputs)?,
            status: ItemStatus::from_str(&self.status).map_err(anyhow::Error::msg)?,
            current_phase: self.current_phase,
            retry_count: self.retry_count as u32,
            errors: from_json_col(&self.errors)?,
            accounting: Accounting {
                cost: decimal_from_col(&self.cost)?,
                tokens: self.tokens as u64,
            },
            processing_time_ms: self.processing_time_ms.map(|v| v as u64),
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp column: {s}"))
}

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// Cloneable handle over a single SQLite connection, guarded by a
/// `tokio::sync::Mutex` so concurrent item tasks serialize their writes
/// without a connection pool. Item rows are written only by the Executor
/// under a permit, so contention is brief.
#[derive(Clone)]
pub struct Repository {
    inner: Arc<Mutex<Inner>>,
}

impl Repository {
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let conn = Connection::open(path).context("failed to open repository database")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let inner = Inner { conn };
        inner.run_migrations()?;
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// Atomically persists a `Job` row and one `Item` row per input; the
    /// job and its items are created together on submit.
    pub async fn create_job(&self, id: &str, definition: &JobDefinition) -> Result<Job> {
        let guard = self.inner.lock().await;
        let now = Utc::now();
        let job = Job {
            id: id.to_string(),
            name: definition.name.clone(),
            group_id: definition.group_id.clone(),
            user_id: definition.user_id.clone(),
            status: JobStatus::Pending,
            phases: definition.phases.clone(),
            options: definition.options.clone(),
            total_items: definition.items.len() as u64,
            completed_items: 0,
            failed_items: 0,
            accounting: Accounting::default(),
            current_phase: None,
            checkpoint: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            error: None,
        };

        let tx = guard
            .conn
            .unchecked_transaction()
            .context("failed to begin create_job transaction")?;
        tx.execute(
            "INSERT INTO job (id, name, group_id, user_id, status, phases, options,
                total_items, completed_items, failed_items, cost, tokens,
                current_phase, checkpoint, created_at, started_at, completed_at,
                updated_at, error)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)",
            params![
                job.id,
                job.name,
                job.group_id,
                job.user_id,
                job.status.as_str(),
                json_col(&job.phases)?,
                json_col(&job.options)?,
                job.total_items as i64,
                0i64,
                0i64,
                decimal_to_col(&job.accounting.cost),
                0i64,
                job.current_phase,
                Option::<String>::None,
                fmt_ts(&job.created_at),
                Option::<String>::None,
                Option::<String>::None,
                fmt_ts(&job.updated_at),
                Option::<String>::None,
            ],
        )
        .context("failed to insert job row")?;

        for (index, input) in definition.items.iter().enumerate() {
            let item = Item::new(&job.id, index as u32, input.clone());
            insert_item(&tx, &item)?;
        }

        tx.commit().context("failed to commit create_job transaction")?;
        Ok(job)
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let guard = self.inner.lock().await;
        let raw = guard
            .conn
            .query_row(
                "SELECT id, name, group_id, user_id, status, phases, options, total_items,
                        completed_items, failed_items, cost, tokens, current_phase, checkpoint,
                        created_at, started_at, completed_at, updated_at, error
                 FROM job WHERE id = ?1",
                params![id],
                Inner::job_from_row,
            )
            .optional()
            .context("failed to query job")?;
        raw.map(RawJob::into_job).transpose()
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage> {
        let guard = self.inner.lock().await;
        let mut sql = String::from(
            "SELECT id, name, group_id, user_id, status, phases, options, total_items,
                    completed_items, failed_items, cost, tokens, current_phase, checkpoint,
                    created_at, started_at, completed_at, updated_at, error
             FROM job WHERE 1=1",
        );
        let mut clauses = Vec::new();
        if filter.group_id.is_some() {
            clauses.push(" AND group_id = ?");
        }
        if filter.user_id.is_some() {
            clauses.push(" AND user_id = ?");
        }
        if filter.status.is_some() {
            clauses.push(" AND status = ?");
        }
        sql.push_str(&clauses.join(""));
        sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");

        let mut stmt = guard.conn.prepare(&sql).context("failed to prepare list_jobs")?;
        let mut idx = 1;
        let mut bind_strings: Vec<String> = Vec::new();
        if let Some(g) = &filter.group_id {
            bind_strings.push(g.clone());
        }
        if let Some(u) = &filter.user_id {
            bind_strings.push(u.clone());
        }
        if let Some(s) = &filter.status {
            bind_strings.push(s.as_str().to_string());
        }
        for v in &bind_strings {
            stmt.raw_bind_parameter(idx, v).context("failed to bind list_jobs parameter")?;
            idx += 1;
        }
        // fetch one extra row to compute has_more without a second COUNT query
        stmt.raw_bind_parameter(idx, (filter.limit as i64) + 1)
            .context("failed to bind limit")?;
        idx += 1;
        stmt.raw_bind_parameter(idx, filter.offset as i64)
            .context("failed to bind offset")?;

        let mut rows = stmt.raw_query();
        let mut raws = Vec::new();
        while let Some(row) = rows.next().context("failed to step list_jobs")? {
            raws.push(Inner::job_from_row(row).context("failed to decode job row")?);
        }
        drop(rows);
        drop(stmt);
        drop(guard);

        let has_more = raws.len() > filter.limit as usize;
        raws.truncate(filter.limit as usize);
        let jobs = raws
            .into_iter()
            .map(RawJob::into_job)
            .collect::<Result<Vec<_>>>()?;
        Ok(JobPage { jobs, has_more })
    }

    pub async fn delete_job(&self, id: &str) -> Result<bool> {
        let guard = self.inner.lock().await;
        let affected = guard
            .conn
            .execute("DELETE FROM job WHERE id = ?1", params![id])
            .context("failed to delete job")?;
        Ok(affected > 0)
    }

    /// Sets `completed_at` on transition into a terminal status and clears
    /// it on transition out of one (e.g. a resumed FAILED job), so it never
    /// carries a stale value from an earlier terminal status.
    pub async fn update_job_status(&self, id: &str, status: JobStatus, error: Option<&str>) -> Result<()> {
        let guard = self.inner.lock().await;
        let now = Utc::now();
        let completed_at = if status.is_terminal() { Some(fmt_ts(&now)) } else { None };
        guard
            .conn
            .execute(
                "UPDATE job SET status = ?1, error = ?2, completed_at = ?3, updated_at = ?4 WHERE id = ?5",
                params![status.as_str(), error, completed_at, fmt_ts(&now), id],
            )
            .context("failed to update job status")?;
        Ok(())
    }

    /// Records the start time and, if the job is still PENDING, transitions
    /// it to RUNNING. Never overwrites a status the job already moved past
    /// PENDING to (e.g. PAUSED, set directly ahead of a fresh `run_job`
    /// call) — `resume`/`start` already put the job in the status the
    /// executor should observe before this runs.
    pub async fn mark_started(&self, id: &str) -> Result<()> {
        let guard = self.inner.lock().await;
        guard
            .conn
            .execute(
                "UPDATE job SET started_at = COALESCE(started_at, ?1),
                 status = CASE WHEN status = 'pending' THEN 'running' ELSE status END,
                 updated_at = ?1 WHERE id = ?2",
                params![fmt_ts(&Utc::now()), id],
            )
            .context("failed to mark job started")?;
        Ok(())
    }

    pub async fn mark_completed(&self, id: &str, status: JobStatus) -> Result<()> {
        let guard = self.inner.lock().await;
        let now = fmt_ts(&Utc::now());
        guard
            .conn
            .execute(
                "UPDATE job SET status = ?1, completed_at = ?2, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, id],
            )
            .context("failed to mark job completed")?;
        Ok(())
    }

    pub async fn set_current_phase(&self, id: &str, phase: &str) -> Result<()> {
        let guard = self.inner.lock().await;
        guard
            .conn
            .execute(
                "UPDATE job SET current_phase = ?1, updated_at = ?2 WHERE id = ?3",
                params![phase, fmt_ts(&Utc::now()), id],
            )
            .context("failed to set current phase")?;
        Ok(())
    }

    /// Analytics reconciliation write: replaces, never
    /// increments, the job-level aggregates.
    pub async fn reconcile_counters(
        &self,
        id: &str,
        completed_items: u64,
        failed_items: u64,
        cost: Decimal,
        tokens: u64,
    ) -> Result<()> {
        let guard = self.inner.lock().await;
        guard
            .conn
            .execute(
                "UPDATE job SET completed_items = ?1, failed_items = ?2, cost = ?3, tokens = ?4, updated_at = ?5 WHERE id = ?6",
                params![
                    completed_items as i64,
                    failed_items as i64,
                    decimal_to_col(&cost),
                    tokens as i64,
                    fmt_ts(&Utc::now()),
                    id
                ],
            )
            .context("failed to reconcile job counters")?;
        Ok(())
    }

    pub async fn save_checkpoint(&self, id: &str, snapshot: &CheckpointSnapshot) -> Result<()> {
        let guard = self.inner.lock().await;
        guard
            .conn
            .execute(
                "UPDATE job SET checkpoint = ?1, current_phase = ?2, completed_items = ?3,
                    failed_items = ?4, cost = ?5, tokens = ?6, updated_at = ?7 WHERE id = ?8",
                params![
                    json_col(snapshot)?,
                    snapshot.current_phase,
                    snapshot.counters.completed_items as i64,
                    snapshot.counters.failed_items as i64,
                    decimal_to_col(&snapshot.counters.cost),
                    snapshot.counters.tokens as i64,
                    fmt_ts(&Utc::now()),
                    id,
                ],
            )
            .context("failed to save checkpoint")?;
        Ok(())
    }

    pub async fn load_checkpoint(&self, id: &str) -> Result<Option<CheckpointSnapshot>> {
        let guard = self.inner.lock().await;
        let raw: Option<Option<String>> = guard
            .conn
            .query_row("SELECT checkpoint FROM job WHERE id = ?1", params![id], |r| r.get(0))
            .optional()
            .context("failed to load checkpoint")?;
        raw.flatten_option().map(|s| from_json_col(&s)).transpose()
    }

    pub async fn clear_checkpoint(&self, id: &str) -> Result<()> {
        let guard = self.inner.lock().await;
        guard
            .conn
            .execute("UPDATE job SET checkpoint = NULL WHERE id = ?1", params![id])
            .context("failed to clear checkpoint")?;
        Ok(())
    }

    /// Nulls out checkpoints on terminal jobs older than `cutoff`, optionally
    /// restricted to one status.
    pub async fn cleanup_checkpoints_older_than(
        &self,
        cutoff: DateTime<Utc>,
        status: Option<JobStatus>,
    ) -> Result<u64> {
        let guard = self.inner.lock().await;
        let affected = match status {
            Some(s) => guard.conn.execute(
                "UPDATE job SET checkpoint = NULL
                 WHERE checkpoint IS NOT NULL AND status = ?1 AND completed_at IS NOT NULL AND completed_at < ?2",
                params![s.as_str(), fmt_ts(&cutoff)],
            ),
            None => guard.conn.execute(
                "UPDATE job SET checkpoint = NULL
                 WHERE checkpoint IS NOT NULL AND status IN ('completed','failed','cancelled')
                   AND completed_at IS NOT NULL AND completed_at < ?1",
                params![fmt_ts(&cutoff)],
            ),
        }
        .context("failed to cleanup checkpoints")?;
        Ok(affected as u64)
    }

    pub async fn get_items(&self, job_id: &str) -> Result<Vec<Item>> {
        let guard = self.inner.lock().await;
        let mut stmt = guard
            .conn
            .prepare(
                "SELECT job_id, item_index, input, metadata, output, phase_outputs, status,
                        current_phase, retry_count, errors, cost, tokens, processing_time_ms,
                        started_at, completed_at
                 FROM item WHERE job_id = ?1 ORDER BY item_index",
            )
            .context("failed to prepare get_items")?;
        let rows = stmt
            .query_map(params![job_id], Inner::item_from_row)
            .context("failed to query items")?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row.context("failed to decode item row")?.into_item()?);
        }
        Ok(items)
    }

    pub async fn get_item(&self, job_id: &str, item_index: u32) -> Result<Option<Item>> {
        let guard = self.inner.lock().await;
        let raw = guard
            .conn
            .query_row(
                "SELECT job_id, item_index, input, metadata, output, phase_outputs, status,
                        current_phase, retry_count, errors, cost, tokens, processing_time_ms,
                        started_at, completed_at
                 FROM item WHERE job_id = ?1 AND item_index = ?2",
                params![job_id, item_index],
                Inner::item_from_row,
            )
            .optional()
            .context("failed to query item")?;
        raw.map(RawItem::into_item).transpose()
    }

    /// Persists the full state of a single item row. Item rows are written
    /// only by the Executor under a permit, so this is a
    /// plain UPSERT-by-replace, never a partial update.
    pub async fn save_item(&self, item: &Item) -> Result<()> {
        let guard = self.inner.lock().await;
        save_item_inner(&guard.conn, item)
    }
}

trait FlattenOption<T> {
    fn flatten_option(self) -> Option<T>;
}

impl<T> FlattenOption<T> for Option<Option<T>> {
    fn flatten_option(self) -> Option<T> {
        self.flatten()
    }
}

fn insert_item(tx: &rusqlite::Transaction, item: &Item) -> Result<()> {
    tx.execute(
        "INSERT INTO item (job_id, item_index, input, metadata, output, phase_outputs, status,
            current_phase, retry_count, errors, cost, tokens, processing_time_ms, started_at, completed_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
        params![
            item.job_id,
            item.item_index as i64,
            item.input,
            item.metadata.as_ref().map(json_col).transpose()?,
            item.output,
            json_col(&item.phase_outputs)?,
            item.status.as_str(),
            item.current_phase,
            item.retry_count as i64,
            json_col(&item.errors)?,
            decimal_to_col(&item.accounting.cost),
            item.accounting.tokens as i64,
            item.processing_time_ms.map(|v| v as i64),
            item.started_at.as_ref().map(fmt_ts),
            item.completed_at.as_ref().map(fmt_ts),
        ],
    )
    .context("failed to insert item row")?;
    Ok(())
}

fn save_item_inner(conn: &Connection, item: &Item) -> Result<()> {
    conn.execute(
        "UPDATE item SET input = ?1, metadata = ?2, output = ?3, phase_outputs = ?4, status = ?5,
            current_phase = ?6, retry_count = ?7, errors = ?8, cost = ?9, tokens = ?10,
            processing_time_ms = ?11, started_at = ?12, completed_at = ?13
         WHERE job_id = ?14 AND item_index = ?15",
        params![
            item.input,
            item.metadata.as_ref().map(json_col).transpose()?,
            item.output,
            json_col(&item.phase_outputs)?,
            item.status.as_str(),
            item.current_phase,
            item.retry_count as i64,
            json_col(&item.errors)?,
            decimal_to_col(&item.accounting.cost),
            item.accounting.tokens as i64,
            item.processing_time_ms.map(|v| v as i64),
            item.started_at.as_ref().map(fmt_ts),
            item.completed_at.as_ref().map(fmt_ts),
            item.job_id,
            item.item_index as i64,
        ],
    )
    .context("failed to update item row")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ItemInput, PhaseConfig};

    fn sample_definition() -> JobDefinition {
        JobDefinition {
            name: "sample".into(),
            group_id: None,
            user_id: None,
            items: vec![
                ItemInput { input: "a".into(), metadata: None },
                ItemInput { input: "b".into(), metadata: None },
            ],
            phases: vec![PhaseConfig::new("extract")],
            options: Default::default(),
        }
    }

    #[tokio::test]
    async fn create_job_persists_job_and_items_atomically() {
        let repo = Repository::open_in_memory().unwrap();
        let job = repo.create_job("job-1", &sample_definition()).await.unwrap();
        assert_eq!(job.total_items, 2);

        let items = repo.get_items("job-1").await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].item_index, 0);
        assert_eq!(items[1].item_index, 1);
    }

    #[tokio::test]
    async fn delete_job_cascades_to_items() {
        let repo = Repository::open_in_memory().unwrap();
        repo.create_job("job-1", &sample_definition()).await.unwrap();
        assert!(repo.delete_job("job-1").await.unwrap());
        assert!(repo.get_job("job-1").await.unwrap().is_none());
        assert!(repo.get_items("job-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_item_round_trips_fields() {
        let repo = Repository::open_in_memory().unwrap();
        repo.create_job("job-1", &sample_definition()).await.unwrap();
        let mut item = repo.get_item("job-1", 0).await.unwrap().unwrap();
        item.status = ItemStatus::Completed;
        item.output = Some("a.".into());
        item.phase_outputs.insert("extract".into(), "a.".into());
        item.accounting.cost = Decimal::new(1, 2);
        item.accounting.tokens = 5;
        repo.save_item(&item).await.unwrap();

        let reloaded = repo.get_item("job-1", 0).await.unwrap().unwrap();
        assert_eq!(reloaded.status, ItemStatus::Completed);
        assert_eq!(reloaded.output.as_deref(), Some("a."));
        assert_eq!(reloaded.accounting.tokens, 5);
    }

    #[tokio::test]
    async fn update_job_status_sets_and_clears_completed_at_on_terminal_transitions() {
        let repo = Repository::open_in_memory().unwrap();
        repo.create_job("job-1", &sample_definition()).await.unwrap();

        repo.update_job_status("job-1", JobStatus::Cancelled, None).await.unwrap();
        let job = repo.get_job("job-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.completed_at.is_some());

        // a resumed job (e.g. FAILED -> RUNNING) must not keep the stale
        // completed_at from the prior terminal status.
        repo.update_job_status("job-1", JobStatus::Running, None).await.unwrap();
        let job = repo.get_job("job-1").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.completed_at.is_none());
    }

    #[tokio::test]
    async fn reconcile_counters_overwrites_job_aggregates() {
        let repo = Repository::open_in_memory().unwrap();
        repo.create_job("job-1", &sample_definition()).await.unwrap();
        repo.reconcile_counters("job-1", 2, 0, Decimal::new(2, 2), 10).await.unwrap();
        let job = repo.get_job("job-1").await.unwrap().unwrap();
        assert_eq!(job.completed_items, 2);
        assert_eq!(job.accounting.tokens, 10);
    }

    #[tokio::test]
    async fn list_jobs_paginates_and_reports_has_more() {
        let repo = Repository::open_in_memory().unwrap();
        for i in 0..3 {
            repo.create_job(&format!("job-{i}"), &sample_definition()).await.unwrap();
        }
        let page = repo
            .list_jobs(&JobFilter { limit: 2, offset: 0, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(page.jobs.len(), 2);
        assert!(page.has_more);

        let page2 = repo
            .list_jobs(&JobFilter { limit: 2, offset: 2, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(page2.jobs.len(), 1);
        assert!(!page2.has_more);
    }

    #[tokio::test]
    async fn checkpoint_save_load_clear_round_trip() {
        let repo = Repository::open_in_memory().unwrap();
        repo.create_job("job-1", &sample_definition()).await.unwrap();
        assert!(repo.load_checkpoint("job-1").await.unwrap().is_none());

        let snapshot = CheckpointSnapshot::new(2);
        repo.save_checkpoint("job-1", &snapshot).await.unwrap();
        assert!(repo.load_checkpoint("job-1").await.unwrap().is_some());

        repo.clear_checkpoint("job-1").await.unwrap();
        assert!(repo.load_checkpoint("job-1").await.unwrap().is_none());
    }
}
