//! # Worker Pool
//!
//! Tokio tasks that pop the scheduler's queue and run stage jobs. An idle
//! worker (queue empty or saturated) sleeps for the poll interval.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::scheduler::Scheduler;

/// Handle on running workers.
pub struct WorkerPool {
    running: Arc<AtomicBool>,
    batches: Arc<AtomicU64>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(scheduler: Scheduler, workers: usize, poll: Duration) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let batches = Arc::new(AtomicU64::new(0));
        let handles = (0..workers)
            .map(|id| {
                let scheduler = scheduler.clone();
                let running = Arc::clone(&running);
                let batches = Arc::clone(&batches);
                tokio::spawn(async move {
                    tracing::debug!("worker {} started", id);
                    while running.load(Ordering::Acquire) {
                        if scheduler.run_once().await {
                            batches.fetch_add(1, Ordering::Relaxed);
                        } else {
                            tokio::time::sleep(poll).await;
                        }
                    }
                    tracing::debug!("worker {} stopped", id);
                })
            })
            .collect();
        Self {
            running,
            batches,
            handles,
        }
    }

    /// Number of workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the pool has no workers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Batches run so far, over all workers.
    #[must_use]
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Stops the workers after their current batch and waits for them.
    pub async fn shutdown(self) {
        self.running.store(false, Ordering::Release);
        for handle in self.handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
            }
        }
    }
}
