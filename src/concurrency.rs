//! Bounded concurrency primitive.
//!
//! A thin wrapper over `tokio::sync::Semaphore`, in the manner of the
//! teacher's `dag::executor` which acquires an owned permit per spawned
//! task and holds it for the task's lifetime. `with_permit` gives callers a
//! scoped acquire-run-release without having to manage the guard manually.

use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};

/// A counting semaphore with `N` permits. Acquisition is
/// FIFO-fair enough that no waiter starves when permits free regularly,
/// which is exactly the guarantee `tokio::sync::Semaphore` provides.
#[derive(Clone)]
pub struct BoundedConcurrency {
    semaphore: Arc<Semaphore>,
}

impl BoundedConcurrency {
    pub fn new(permits: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Acquire a permit, scoped to the guard's lifetime.
    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        self.semaphore
            .acquire()
            .await
            .expect("semaphore is never closed while the executor holds a clone")
    }

    /// Acquire an owned permit that can be moved into a spawned task.
    pub async fn acquire_owned(&self) -> tokio::sync::OwnedSemaphorePermit {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed while the executor holds a clone")
    }

    /// Run `fn` while holding a permit, releasing it on success or failure.
    pub async fn with_permit<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let _permit = self.acquire().await;
        f().await
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn with_permit_releases_after_completion() {
        let bc = BoundedConcurrency::new(1);
        assert_eq!(bc.available_permits(), 1);
        bc.with_permit(|| async { tokio::time::sleep(Duration::from_millis(1)).await })
            .await;
        assert_eq!(bc.available_permits(), 1);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let bc = BoundedConcurrency::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let bc = bc.clone();
            let active = active.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                bc.with_permit(|| async {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn permit_released_even_if_future_is_cancelled() {
        let bc = BoundedConcurrency::new(1);
        let permit = bc.acquire_owned().await;
        assert_eq!(bc.available_permits(), 0);
        drop(permit);
        assert_eq!(bc.available_permits(), 1);
    }
}
