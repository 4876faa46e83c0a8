//! Bounded worker pool shared by every job runner and finalizer.
//!
//! The bound is process-wide: it caps the number of fetches and
//! finalizations in flight across all tasks, not per task.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, trace};

#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Spawn `work` once a worker slot is free. The caller never waits for
    /// the slot; queued units wait inside their own task.
    pub fn spawn<F>(&self, name: &'static str, work: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Worker pool closed, dropping {}: {}", name, e);
                    return;
                }
            };
            trace!("Worker slot acquired for {}", name);
            work.await;
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Units currently holding a worker slot.
    pub fn busy(&self) -> usize {
        self.size - self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_bounds_concurrency() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                pool.spawn("job", async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.busy(), 0);
    }

    #[test]
    fn test_zero_size_is_clamped() {
        assert_eq!(WorkerPool::new(0).size(), 1);
    }
}
