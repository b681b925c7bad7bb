//! Bounded worker pool for stage runs
//!
//! A single producer feeds keys into a bounded channel; a fixed set of
//! workers pulls from it. A full channel blocks the producer, which keeps
//! outstanding store and backend I/O capped at roughly
//! `workers + queue_capacity` jobs.

use futures::{Stream, StreamExt};
use futures_util::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use crate::config::ProcessingConfig;
use crate::error::{ErrorKind, Result};

use super::progress::{CancellationFlag, KeyStatus, ProgressTracker};

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    /// Every listed key was dispatched
    Completed,
    /// Dispatch stopped early; queued and in-flight jobs still finished
    Cancelled,
}

/// Fixed-size pool of job workers
#[derive(Debug, Clone)]
pub struct StageWorkerPool {
    workers: usize,
    queue_capacity: usize,
    job_timeout: Duration,
    batch_size: usize,
}

impl StageWorkerPool {
    pub fn new(workers: usize, queue_capacity: usize, job_timeout: Duration, batch_size: usize) -> Self {
        Self {
            workers: workers.max(1),
            queue_capacity: queue_capacity.max(1),
            job_timeout,
            batch_size: batch_size.max(1),
        }
    }

    pub fn from_config(config: &ProcessingConfig) -> Self {
        Self::new(
            config.workers(),
            config.queue_capacity(),
            config.job_timeout(),
            config.batch_size,
        )
    }

    /// Same pool with a different worker count
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `job` for every key of `keys`
    ///
    /// Returns once all dispatched jobs are done. A listing error stops
    /// dispatch and is returned after the workers drain.
    pub async fn run<S, F, Fut>(
        &self,
        keys: S,
        tracker: Arc<ProgressTracker>,
        cancel: &CancellationFlag,
        job: F,
    ) -> Result<RunEnd>
    where
        S: Stream<Item = Result<String>> + Send,
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = KeyStatus> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<String>(self.queue_capacity);
        let rx = Arc::new(Mutex::new(rx));
        let job = Arc::new(job);

        tracing::info!(
            "[{}] Starting {} workers (queue {}, timeout {}s)",
            tracker.label(),
            self.workers,
            self.queue_capacity,
            self.job_timeout.as_secs()
        );

        let handles: Vec<_> = (0..self.workers)
            .map(|_| {
                let rx = rx.clone();
                let job = job.clone();
                let tracker = tracker.clone();
                let job_timeout = self.job_timeout;
                tokio::spawn(async move {
                    loop {
                        let key = {
                            let mut rx = rx.lock().await;
                            rx.recv().await
                        };
                        let Some(key) = key else { break };
                        let started = Instant::now();
                        let status = run_job(&key, job(key.clone()), job_timeout).await;
                        tracker.record(&key, status, started.elapsed());
                    }
                })
            })
            .collect();

        let mut end = RunEnd::Completed;
        let mut listing_error = None;
        let mut dispatched = 0usize;
        let mut keys = std::pin::pin!(keys);

        while let Some(next) = keys.next().await {
            match next {
                Ok(key) => {
                    if dispatched > 0 && dispatched % self.batch_size == 0 && cancel.is_cancelled() {
                        end = RunEnd::Cancelled;
                        break;
                    }
                    tracker.add_dispatched(1);
                    if tx.send(key).await.is_err() {
                        break;
                    }
                    dispatched += 1;
                }
                Err(e) => {
                    tracing::error!("[{}] Listing failed after {} keys: {}", tracker.label(), dispatched, e);
                    listing_error = Some(e);
                    break;
                }
            }
        }
        if end == RunEnd::Completed && listing_error.is_none() && cancel.is_cancelled() {
            end = RunEnd::Cancelled;
        }
        drop(tx);

        for handle in join_all(handles).await {
            if let Err(e) = handle {
                tracing::error!("[{}] Worker task failed: {}", tracker.label(), e);
            }
        }

        match listing_error {
            Some(e) => Err(e),
            None => Ok(end),
        }
    }
}

/// Run one job on its own task so a panic or timeout cannot take the worker down
async fn run_job<Fut>(key: &str, fut: Fut, job_timeout: Duration) -> KeyStatus
where
    Fut: Future<Output = KeyStatus> + Send + 'static,
{
    let mut handle = tokio::spawn(fut);
    match timeout(job_timeout, &mut handle).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            tracing::error!("[{}] Job panicked: {}", key, e);
            KeyStatus::Failed {
                kind: ErrorKind::Internal,
                detail: format!("job panicked: {}", e),
            }
        }
        Err(_) => {
            handle.abort();
            tracing::error!("[{}] TIMEOUT after {}s", key, job_timeout.as_secs());
            KeyStatus::Failed {
                kind: ErrorKind::Timeout,
                detail: format!("Timed out after {}s", job_timeout.as_secs()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn keys(n: usize) -> impl Stream<Item = Result<String>> + Send {
        futures::stream::iter((0..n).map(|i| Ok(format!("k{:04}", i))))
    }

    #[tokio::test]
    async fn test_every_key_processed() {
        let pool = StageWorkerPool::new(4, 2, Duration::from_secs(5), 10);
        let tracker = Arc::new(ProgressTracker::new("test", 100));

        let end = pool
            .run(keys(50), tracker.clone(), &CancellationFlag::new(), |_key| async {
                KeyStatus::Written
            })
            .await
            .unwrap();

        assert_eq!(end, RunEnd::Completed);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.total, 50);
        assert_eq!(snapshot.written, 50);
    }

    #[tokio::test]
    async fn test_timeout_marks_key_failed() {
        let pool = StageWorkerPool::new(2, 2, Duration::from_millis(50), 10);
        let tracker = Arc::new(ProgressTracker::new("test", 100));

        pool.run(keys(3), tracker.clone(), &CancellationFlag::new(), |key| async move {
            if key == "k0001" {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
            KeyStatus::Written
        })
        .await
        .unwrap();

        assert_eq!(tracker.snapshot().written, 2);
        assert!(matches!(
            tracker.status_of("k0001"),
            Some(KeyStatus::Failed { kind: ErrorKind::Timeout, .. })
        ));
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_stop_the_pool() {
        let pool = StageWorkerPool::new(1, 1, Duration::from_secs(5), 10);
        let tracker = Arc::new(ProgressTracker::new("test", 100));

        pool.run(keys(3), tracker.clone(), &CancellationFlag::new(), |key| async move {
            if key == "k0000" {
                panic!("boom");
            }
            KeyStatus::Written
        })
        .await
        .unwrap();

        assert_eq!(tracker.snapshot().processed, 3);
        assert_eq!(tracker.failed_keys(), vec!["k0000".to_string()]);
    }

    #[tokio::test]
    async fn test_cancellation_between_batches() {
        let pool = StageWorkerPool::new(2, 1, Duration::from_secs(5), 5);
        let tracker = Arc::new(ProgressTracker::new("test", 100));
        let cancel = CancellationFlag::new();
        let started = Arc::new(AtomicUsize::new(0));

        let job_cancel = cancel.clone();
        let job_started = started.clone();
        let end = pool
            .run(keys(100), tracker.clone(), &cancel, move |_key| {
                let cancel = job_cancel.clone();
                let started = job_started.clone();
                async move {
                    if started.fetch_add(1, Ordering::SeqCst) == 0 {
                        cancel.cancel();
                    }
                    KeyStatus::Written
                }
            })
            .await
            .unwrap();

        assert_eq!(end, RunEnd::Cancelled);
        let snapshot = tracker.snapshot();
        // Everything dispatched still completed
        assert_eq!(snapshot.processed, snapshot.total);
        assert!(snapshot.total < 100);
        assert_eq!(snapshot.total % 5, 0);
    }

    #[tokio::test]
    async fn test_listing_error_propagates_after_drain() {
        let pool = StageWorkerPool::new(2, 2, Duration::from_secs(5), 10);
        let tracker = Arc::new(ProgressTracker::new("test", 100));
        let listing = futures::stream::iter(vec![
            Ok("a".to_string()),
            Ok("b".to_string()),
            Err(Error::store_unavailable("connection reset")),
        ]);

        let err = pool
            .run(listing, tracker.clone(), &CancellationFlag::new(), |_key| async {
                KeyStatus::Written
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
        assert_eq!(tracker.snapshot().processed, 2);
    }
}
