//! The Processor interface — the contract the Batch Executor invokes to
//! realize a single item's transformation through a single phase. The
//! processing function itself (model selection, prompt construction,
//! network I/O) is an external collaborator and out of scope; this module
//! only defines the abstraction and a cancellation signal, as an
//! `#[async_trait]` trait over real work with a matching in-memory test
//! double.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::model::PhaseConfig;

/// Cooperative cancellation signal passed into `Processor::process`. The
/// Processor must observe it and abort within a reasonable bound; the
/// engine never forcibly kills a Processor invocation.
#[derive(Clone, Default)]
pub struct CancelSignal {
    cancelled: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// The successful result of one `process` invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedOutput {
    pub output: String,
    pub cost: Decimal,
    pub tokens: u64,
}

/// Failure from a Processor invocation. Timeouts are represented the same
/// way the retry policy treats them — as an ordinary `ProcessingError`.
#[derive(Debug, Error, Clone)]
pub enum ProcessingError {
    #[error("processor failed: {0}")]
    Failed(String),

    #[error("processor timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Per-item, per-phase work, realized by an external collaborator. May be
/// invoked concurrently across items and must be re-entrant across retries:
/// the same `(job_id, item_index, phase_name)` may be invoked multiple
/// times.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(
        &self,
        input: &str,
        phase: &PhaseConfig,
        cancel: &CancelSignal,
    ) -> Result<ProcessedOutput, ProcessingError>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// A scripted Processor test double: returns queued results per phase,
    /// falling back to a default success when the queue for a phase is
    /// exhausted. Used by executor and job-manager tests to drive
    /// retry/dead-letter/multi-phase scenarios without a real LLM call.
    pub struct ScriptedProcessor {
        queue: Mutex<std::collections::HashMap<String, std::collections::VecDeque<Result<ProcessedOutput, ProcessingError>>>>,
        pub calls: std::sync::atomic::AtomicUsize,
    }

    impl ScriptedProcessor {
        pub fn new() -> Self {
            Self {
                queue: Mutex::new(std::collections::HashMap::new()),
                calls: std::sync::atomic::AtomicUsize::new(0),
            }
        }

        /// Queue a scripted result for a specific item key (e.g. "A:0").
        pub fn push(&self, key: &str, result: Result<ProcessedOutput, ProcessingError>) {
            self.queue
                .lock()
                .unwrap()
                .entry(key.to_string())
                .or_default()
                .push_back(result);
        }
    }

    #[async_trait]
    impl Processor for ScriptedProcessor {
        async fn process(
            &self,
            input: &str,
            phase: &PhaseConfig,
            _cancel: &CancelSignal,
        ) -> Result<ProcessedOutput, ProcessingError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let key = format!("{}:{}", phase.name, input);
            if let Some(result) = self
                .queue
                .lock()
                .unwrap()
                .get_mut(&key)
                .and_then(|q| q.pop_front())
            {
                return result;
            }
            Ok(ProcessedOutput {
                output: format!("{}:{}", phase.name, input),
                cost: Decimal::new(1, 2),
                tokens: 5,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_signal_defaults_to_not_cancelled() {
        let signal = CancelSignal::new();
        assert!(!signal.is_cancelled());
        signal.cancel();
        assert!(signal.is_cancelled());
    }

    #[test]
    fn cancel_signal_clones_share_state() {
        let signal = CancelSignal::new();
        let clone = signal.clone();
        clone.cancel();
        assert!(signal.is_cancelled());
    }
}
