//! Bounded parallel executor for per-object API operations.
use std::{
    future::Future,
    sync::{Arc, Mutex},
};

use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::debug;

/// One unit of work: a single replica of one object spec in one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    /// Iteration the replica belongs to, starting at 1.
    pub iteration: u32,
    /// Index into the job's object list.
    pub spec_index: usize,
    /// Replica number within the iteration, starting at 1.
    pub replica: u32,
}

/// Fixed-size pool of workers draining a bounded queue of [`WorkItem`]s.
///
/// Item-level failures are accumulated, not propagated; the pool only stops
/// early on cancellation. The queue bound provides backpressure towards the
/// producer, though pacing is the rate limiter's job.
pub struct WorkerPool {
    tx: mpsc::Sender<WorkItem>,
    tracker: TaskTracker,
    errors: Arc<Mutex<Vec<String>>>,
}

impl WorkerPool {
    /// Spawn `workers` tasks executing `handler` for each dispatched item.
    pub fn start<F, Fut>(workers: usize, handler: F, cancel: CancellationToken) -> Self
    where
        F: Fn(WorkItem) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<(), String>> + Send,
    {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<WorkItem>(workers * 2);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let tracker = TaskTracker::new();
        let errors: Arc<Mutex<Vec<String>>> = Arc::default();
        for worker in 0..workers {
            let rx = rx.clone();
            let handler = handler.clone();
            let cancel = cancel.clone();
            let errors = errors.clone();
            tracker.spawn(async move {
                loop {
                    let item = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => None,
                            item = rx.recv() => item,
                        }
                    };
                    let Some(item) = item else { break };
                    if let Err(err) = handler(item).await {
                        errors
                            .lock()
                            .expect("should be able to acquire error lock")
                            .push(err);
                    }
                }
                debug!(worker, "worker drained");
            });
        }
        tracker.close();
        Self {
            tx,
            tracker,
            errors,
        }
    }

    /// Enqueue one item, blocking while the queue is full.
    ///
    /// Returns false once the pool has been cancelled.
    pub async fn dispatch(&self, item: WorkItem) -> bool {
        self.tx.send(item).await.is_ok()
    }

    /// Close the queue, wait for workers to drain, and return the
    /// accumulated item errors.
    pub async fn drain(self) -> Vec<String> {
        drop(self.tx);
        self.tracker.wait().await;
        std::mem::take(
            &mut *self
                .errors
                .lock()
                .expect("should be able to acquire error lock"),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    #[tokio::test]
    async fn executes_every_item() {
        let seen = Arc::new(AtomicU64::new(0));
        let handler = {
            let seen = seen.clone();
            move |_item: WorkItem| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        };
        let pool = WorkerPool::start(4, handler, CancellationToken::new());
        for iteration in 1..=10 {
            for replica in 1..=3 {
                assert!(
                    pool.dispatch(WorkItem {
                        iteration,
                        spec_index: 0,
                        replica,
                    })
                    .await
                );
            }
        }
        let errors = pool.drain().await;
        assert!(errors.is_empty());
        assert_eq!(seen.load(Ordering::SeqCst), 30);
    }

    #[tokio::test]
    async fn item_errors_accumulate_without_stopping_the_pool() {
        let handler = |item: WorkItem| async move {
            if item.replica % 2 == 0 {
                Err(format!("replica {} failed", item.replica))
            } else {
                Ok(())
            }
        };
        let pool = WorkerPool::start(2, handler, CancellationToken::new());
        for replica in 1..=6 {
            pool.dispatch(WorkItem {
                iteration: 1,
                spec_index: 0,
                replica,
            })
            .await;
        }
        let errors = pool.drain().await;
        assert_eq!(errors.len(), 3);
    }

    #[tokio::test]
    async fn cancellation_stops_workers() {
        let cancel = CancellationToken::new();
        // Handlers observe the token themselves, the way the real submit
        // handler does through the rate limiter and the API client.
        let handler = {
            let cancel = cancel.clone();
            move |_item: WorkItem| {
                let cancel = cancel.clone();
                async move {
                    tokio::select! {
                        _ = cancel.cancelled() => Err("cancelled".to_owned()),
                        _ = tokio::time::sleep(std::time::Duration::from_secs(60)) => Ok(()),
                    }
                }
            }
        };
        let pool = WorkerPool::start(1, handler, cancel.clone());
        pool.dispatch(WorkItem {
            iteration: 1,
            spec_index: 0,
            replica: 1,
        })
        .await;
        cancel.cancel();
        // Drain returns even though the in-flight handler never finishes on
        // its own; remaining queue items are dropped.
        tokio::time::timeout(std::time::Duration::from_secs(5), pool.drain())
            .await
            .expect("drain should not hang");
    }
}
