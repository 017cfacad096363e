//! Job queue for pipeline runs.
//!
//! Jobs only carry identifiers; the tracker row is the source of truth. A
//! job whose tracker moved on in the meantime is dropped by the worker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ImportError;

/// One dispatch of one tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineJob {
    /// Job id, recorded on the tracker while it runs.
    pub jid: String,
    pub tracker_id: i64,
    pub entity_id: i64,
    pub stage: u32,
    /// Consecutive transient failures of the current page.
    pub attempt: u32,
}

impl PipelineJob {
    pub fn new(tracker_id: i64, entity_id: i64, stage: u32) -> Self {
        Self {
            jid: uuid::Uuid::new_v4().to_string(),
            tracker_id,
            entity_id,
            stage,
            attempt: 0,
        }
    }

    /// Same tracker, next attempt of the same page.
    pub fn retry(&self) -> Self {
        Self {
            jid: uuid::Uuid::new_v4().to_string(),
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }

    /// Same tracker, next page.
    pub fn next_page(&self) -> Self {
        Self {
            jid: uuid::Uuid::new_v4().to_string(),
            attempt: 0,
            ..self.clone()
        }
    }
}

pub trait JobQueue: Send + Sync {
    fn enqueue(&self, job: PipelineJob) -> BoxFuture<'_, Result<(), ImportError>>;

    fn enqueue_in(&self, job: PipelineJob, delay: Duration) -> BoxFuture<'_, Result<(), ImportError>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// InProcessQueue
// ─────────────────────────────────────────────────────────────────────────────

/// Unbounded channel feeding the local worker pool.
///
/// Delayed jobs wait on a timer task; cancelling the queue drops them.
#[derive(Clone)]
pub struct InProcessQueue {
    tx: mpsc::UnboundedSender<PipelineJob>,
    pending: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

/// Receiving half of an [`InProcessQueue`].
pub struct JobReceiver {
    rx: mpsc::UnboundedReceiver<PipelineJob>,
    pending: Arc<AtomicUsize>,
}

impl InProcessQueue {
    pub fn new(cancel: CancellationToken) -> (Self, JobReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        (
            Self { tx, pending: pending.clone(), cancel },
            JobReceiver { rx, pending },
        )
    }

    /// Jobs queued or waiting on a delay.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    fn send(&self, job: PipelineJob) -> Result<(), ImportError> {
        self.tx
            .send(job)
            .map_err(|_| ImportError::Internal("Job queue is closed".into()))
    }
}

impl JobQueue for InProcessQueue {
    fn enqueue(&self, job: PipelineJob) -> BoxFuture<'_, Result<(), ImportError>> {
        Box::pin(async move {
            debug!(tracker_id = job.tracker_id, "[WORKER] Enqueued job {}", job.jid);
            self.pending.fetch_add(1, Ordering::SeqCst);
            self.send(job).inspect_err(|_| {
                self.pending.fetch_sub(1, Ordering::SeqCst);
            })
        })
    }

    fn enqueue_in(&self, job: PipelineJob, delay: Duration) -> BoxFuture<'_, Result<(), ImportError>> {
        Box::pin(async move {
            if self.tx.is_closed() {
                return Err(ImportError::Internal("Job queue is closed".into()));
            }

            self.pending.fetch_add(1, Ordering::SeqCst);
            let queue = self.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = queue.cancel.cancelled() => {
                        queue.pending.fetch_sub(1, Ordering::SeqCst);
                    }
                    _ = tokio::time::sleep(delay) => {
                        if queue.send(job).is_err() {
                            queue.pending.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                }
            });
            Ok(())
        })
    }
}

impl JobReceiver {
    /// Next job, or `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<PipelineJob> {
        let job = self.rx.recv().await?;
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Some(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn enqueued_jobs_are_received_in_order() {
        let (queue, mut rx) = InProcessQueue::new(CancellationToken::new());
        let first = PipelineJob::new(1, 1, 0);
        let second = PipelineJob::new(2, 1, 1);

        queue.enqueue(first.clone()).await.unwrap();
        queue.enqueue(second.clone()).await.unwrap();
        assert_eq!(queue.pending(), 2);

        assert_eq!(rx.recv().await, Some(first));
        assert_eq!(rx.recv().await, Some(second));
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn delayed_job_arrives_after_delay() {
        let (queue, mut rx) = InProcessQueue::new(CancellationToken::new());
        let job = PipelineJob::new(1, 1, 0).retry();

        queue.enqueue_in(job.clone(), Duration::from_millis(30)).await.unwrap();
        assert_eq!(queue.pending(), 1);

        assert!(timeout(Duration::from_millis(5), rx.recv()).await.is_err());
        let received = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(received.attempt, 1);
        assert_eq!(received.tracker_id, 1);
    }

    #[tokio::test]
    async fn cancelled_queue_drops_delayed_jobs() {
        let cancel = CancellationToken::new();
        let (queue, _rx) = InProcessQueue::new(cancel.clone());

        queue
            .enqueue_in(PipelineJob::new(1, 1, 0), Duration::from_secs(60))
            .await
            .unwrap();
        cancel.cancel();

        timeout(Duration::from_secs(2), async {
            while queue.pending() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn retry_and_next_page_track_attempts() {
        let job = PipelineJob::new(3, 2, 1);
        let retried = job.retry().retry();
        assert_eq!(retried.attempt, 2);
        assert_ne!(retried.jid, job.jid);

        let next = retried.next_page();
        assert_eq!(next.attempt, 0);
        assert_eq!((next.tracker_id, next.entity_id, next.stage), (3, 2, 1));
    }
}
