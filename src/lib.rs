//! Batch pipeline execution engine.
//!
//! ## Module Map
//!
//! ```text
//! ┌─────────────┐        ┌───────────────────┐        ┌──────────────────┐
//! │ job_manager │ ─────> │     executor       │ ─────> │    processor     │
//! │ (state       │        │ (per-phase loop,   │        │ (external        │
//! │  machine,    │        │  retries, chunking, │        │  transformation, │
//! │  validation) │        │  reconciliation)    │        │  trait + double) │
//! └──────┬───────┘        └─────────┬──────────┘        └──────────────────┘
//!        │                          │
//!        v                          v
//! ┌─────────────┐        ┌───────────────────┐
//! │ repository   │ <────> │    checkpoint      │
//! │ (SQLite,     │        │ (cadence predicate, │
//! │  JSON cols)  │        │  durable snapshots)  │
//! └─────────────┘        └───────────────────┘
//! ```
//!
//! `model` defines the shared domain types; `errors` the typed failure
//! hierarchy; `config` the engine-wide tunables; `concurrency` the bounded
//! semaphore primitive used by the executor.

pub mod checkpoint;
pub mod concurrency;
pub mod config;
pub mod errors;
pub mod executor;
pub mod job_manager;
pub mod model;
pub mod processor;
pub mod repository;

pub use errors::{EngineError, EngineResult};
pub use executor::{BatchExecutor, RunOutcome, StopReason};
pub use job_manager::{
    CostAnalytics, JobAnalytics, JobManager, OverallAnalytics, PerformanceAnalytics, PhaseAnalytics,
    StatusProjection, TokensAnalytics,
};
pub use model::{Job, JobDefinition, JobStatus};
pub use processor::{CancelSignal, ProcessedOutput, ProcessingError, Processor};
pub use repository::{JobFilter, JobPage, Repository};
