use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::contracts::MetricsError;

/// A unit of work run by one pool worker.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of workers draining a bounded job queue.
///
/// Each worker runs one job at a time on the blocking thread pool, so a
/// worker counts as busy until its job returns. Submission never waits. Closing the queue lets workers finish every job
/// already queued before they exit.
pub struct WorkerPool {
    jobs: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` tasks on `runtime` sharing a queue of `capacity` jobs.
    pub fn spawn(runtime: &Handle, workers: usize, capacity: usize) -> Self {
        let (jobs, queue) = mpsc::channel::<Job>(capacity);
        let queue = Arc::new(Mutex::new(queue));

        let workers = (0..workers)
            .map(|worker| {
                let queue = Arc::clone(&queue);
                runtime.spawn(async move {
                    loop {
                        let job = queue.lock().await.recv().await;
                        let Some(job) = job else {
                            break;
                        };
                        // derivation is CPU-bound, keep it off the async workers
                        if let Err(e) = tokio::task::spawn_blocking(job).await {
                            tracing::error!(worker = worker, error = %e, "Processing job failed");
                        }
                    }
                    tracing::debug!(worker = worker, "Worker stopped");
                })
            })
            .collect();

        Self { jobs, workers }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queues `job` if there is room.
    pub fn try_submit(&self, job: Job) -> Result<(), TrySendError<Job>> {
        self.jobs.try_send(job)
    }

    /// Closes the queue and waits for the workers to drain it.
    pub async fn shutdown(self) -> Result<(), MetricsError> {
        let Self { jobs, workers } = self;
        drop(jobs);
        for worker in workers {
            worker
                .await
                .map_err(|e| MetricsError::TaskJoin(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_queued_jobs_complete_after_shutdown() {
        let pool = WorkerPool::spawn(&Handle::current(), 4, 16);
        assert_eq!(pool.worker_count(), 4);

        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let done = Arc::clone(&done);
            assert!(pool
                .try_submit(Box::new(move || {
                    done.fetch_add(1, Ordering::SeqCst);
                }))
                .is_ok());
        }

        pool.shutdown().await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_queue_rejects_without_blocking() {
        let pool = WorkerPool::spawn(&Handle::current(), 1, 1);
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        // occupy the single worker
        pool.try_submit(Box::new(move || {
            started_tx.send(()).ok();
            release_rx.recv().ok();
        }))
        .unwrap_or_else(|_| panic!("first job should be accepted"));
        tokio::task::spawn_blocking(move || started_rx.recv_timeout(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();

        assert!(pool.try_submit(Box::new(|| {})).is_ok());
        assert!(matches!(
            pool.try_submit(Box::new(|| {})),
            Err(TrySendError::Full(_))
        ));

        release_tx.send(()).unwrap();
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_stop_worker() {
        let pool = WorkerPool::spawn(&Handle::current(), 1, 4);
        let done = Arc::new(AtomicUsize::new(0));

        assert!(pool.try_submit(Box::new(|| panic!("job failed"))).is_ok());
        let after = Arc::clone(&done);
        assert!(pool
            .try_submit(Box::new(move || {
                after.fetch_add(1, Ordering::SeqCst);
            }))
            .is_ok());

        pool.shutdown().await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
