//! Bounded background pool for cache rebuilds.
//!
//! Logical-expiry cache reads never block the caller: when a hot entry has
//! gone stale, the reader that wins the rebuild lock hands the reload to
//! this pool and returns the stale value immediately. The pool caps the
//! number of concurrently running rebuilds system-wide, so a burst of
//! expiring hot keys cannot flood the source of truth.
//!
//! The pool is an explicitly constructed, explicitly owned value with a
//! shutdown/drain path; there are no process-global executors.

use std::sync::Arc;
use tokio::sync::Semaphore;

/// Semaphore-bounded submit-and-forget task pool.
///
/// At most `capacity` submitted tasks run at any moment; excess tasks wait
/// for a slot. Cloning shares the same capacity.
#[derive(Clone)]
pub struct RebuildPool {
    permits: Arc<Semaphore>,
    capacity: u32,
}

impl RebuildPool {
    /// Create a pool running at most `capacity` tasks concurrently.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        assert!(capacity > 0, "rebuild pool capacity must be greater than 0");
        Self {
            permits: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
        }
    }

    /// Number of tasks allowed to run concurrently.
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Submit a task. Returns immediately; the task runs once a slot frees
    /// up. Tasks submitted after [`shutdown`](Self::shutdown) are dropped.
    pub fn submit<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);

        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                tracing::debug!("rebuild pool is shut down, dropping task");
                return;
            };
            task.await;
        });
    }

    /// Drain the pool: wait for every running and queued task to finish,
    /// then refuse all further submissions.
    pub async fn shutdown(&self) {
        // Holding every permit means nothing is running and nothing queued
        // ahead of us remains; queued acquisitions are served in FIFO
        // order, so outstanding work completes before this returns.
        let drained = self.permits.acquire_many(self.capacity).await;

        self.permits.close();
        drop(drained);

        tracing::info!("rebuild pool drained and closed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn runs_submitted_tasks() {
        let pool = RebuildPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            pool.submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        pool.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn never_exceeds_capacity() {
        let pool = RebuildPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.submit(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        pool.shutdown().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn submissions_after_shutdown_are_dropped() {
        let pool = RebuildPool::new(1);
        pool.shutdown().await;

        let counter = Arc::new(AtomicUsize::new(0));
        let cloned = Arc::clone(&counter);
        pool.submit(async move {
            cloned.fetch_add(1, Ordering::SeqCst);
        });

        sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
