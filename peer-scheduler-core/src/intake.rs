//! C4 — Pod Intake (leader only).
//!
//! A bounded FIFO of pods waiting to enter the scheduling pipeline.
//! Populated two ways: the leader-only cluster pod watcher
//! (`cluster::PodSource`) for pods already committed to the API server,
//! and the admission webhook (server crate) for pods caught before they
//! land, so a pod is only ever scheduled once even under a race between
//! the two sources.

use tokio::sync::mpsc;

use crate::error::{Result, SchedulerError};
use crate::types::Pod;

/// Default bound on outstanding intake items (§4.4: "bounded FIFO,
/// capacity approx 10^6"). `Config::intake_queue_depth` defaults to this
/// and is what `main.rs` actually wires in; this constant is only the
/// fallback used when a caller builds a queue directly, e.g. in tests.
pub const DEFAULT_QUEUE_DEPTH: usize = 1_000_000;

/// A bounded MPSC queue of pods awaiting scheduling. Cloning an
/// `IntakeQueue` handle is cheap and shares the same underlying queue —
/// both the pod watcher and the webhook hold a clone of the sender
/// side, the dispatch workers hold the receiver.
pub struct IntakeQueue {
    tx: mpsc::Sender<Pod>,
}

pub struct IntakeReceiver {
    rx: mpsc::Receiver<Pod>,
}

impl IntakeQueue {
    /// Builds a fresh queue of the given depth, returning the sender
    /// handle (cloned into watchers) and the single receiver handle
    /// (owned by the dispatch pool).
    pub fn new(depth: usize) -> (Self, IntakeReceiver) {
        let (tx, rx) = mpsc::channel(depth);
        (Self { tx }, IntakeReceiver { rx })
    }

    /// Enqueues a pod, back-pressuring the caller (rather than
    /// dropping) when the queue is full — a watcher stalls, it doesn't
    /// silently lose work.
    pub async fn enqueue(&self, pod: Pod) -> Result<()> {
        self.tx
            .send(pod)
            .await
            .map_err(|_| SchedulerError::QueueClosed)
    }

    /// Non-blocking variant used by the webhook handler, which must
    /// respond to the API server promptly: a full queue here is
    /// reported as admission failure rather than stalling the request.
    pub fn try_enqueue(&self, pod: Pod) -> Result<()> {
        self.tx
            .try_send(pod)
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => {
                    SchedulerError::LocalEngineFailure("intake queue full".into())
                }
                mpsc::error::TrySendError::Closed(_) => SchedulerError::QueueClosed,
            })
    }
}

impl Clone for IntakeQueue {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl IntakeReceiver {
    pub async fn recv(&mut self) -> Option<Pod> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(name: &str) -> Pod {
        Pod {
            namespace: "default".into(),
            name: name.into(),
            uid: "uid-1".into(),
            scheduler_name: "peer-scheduler".into(),
            spec: Vec::new(),
        }
    }

    #[tokio::test]
    async fn enqueued_pods_come_out_in_order() {
        let (queue, mut rx) = IntakeQueue::new(4);
        queue.enqueue(pod("a")).await.unwrap();
        queue.enqueue(pod("b")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().name, "a");
        assert_eq!(rx.recv().await.unwrap().name, "b");
    }

    #[tokio::test]
    async fn try_enqueue_reports_full_queue() {
        let (queue, _rx) = IntakeQueue::new(1);
        queue.try_enqueue(pod("a")).unwrap();
        let err = queue.try_enqueue(pod("b")).unwrap_err();
        assert!(matches!(err, SchedulerError::LocalEngineFailure(_)));
    }

    #[tokio::test]
    async fn enqueue_after_receiver_drop_reports_queue_closed() {
        let (queue, rx) = IntakeQueue::new(1);
        drop(rx);
        let err = queue.enqueue(pod("a")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::QueueClosed));
    }
}
