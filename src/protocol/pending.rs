//! Outstanding snapshot requests.
//!
//! # States
//! ```text
//! Sent → Resolved   reply with a matching id arrived
//! Sent → Abandoned  worker terminated or closed, or the future was dropped
//! Sent → TimedOut   PendingSnapshot::timeout elapsed
//! ```
//!
//! A slot leaves the map on every transition, so each request settles at
//! most once.

use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::protocol::message::RequestId;
use crate::runtime::{WorkerError, WorkerId};

#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The request can no longer be answered.
    #[error("snapshot request {0} was abandoned before a reply arrived")]
    Abandoned(RequestId),

    /// No reply arrived in time.
    #[error("snapshot request {request} timed out after {timeout:?}")]
    TimedOut {
        request: RequestId,
        timeout: Duration,
    },

    /// The request could not be sent.
    #[error("failed to send snapshot request: {0}")]
    Send(#[from] WorkerError),
}

struct Slot {
    worker: WorkerId,
    reply: oneshot::Sender<Value>,
}

/// Pending snapshot requests of one host, keyed by request id.
#[derive(Default)]
pub struct PendingRequests {
    next_id: AtomicU64,
    slots: DashMap<RequestId, Slot>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request addressed to `worker` and return its future.
    pub fn register(self: &Arc<Self>, worker: WorkerId) -> PendingSnapshot {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.slots.insert(id, Slot { worker, reply: tx });
        PendingSnapshot {
            id,
            worker,
            reply: rx,
            requests: Arc::clone(self),
            settled: false,
        }
    }

    /// Fulfil a request sent to `worker`. Returns `false` if no request
    /// with this id is pending for that worker.
    pub fn resolve(&self, worker: WorkerId, id: RequestId, data: Value) -> bool {
        match self.slots.remove_if(&id, |_, slot| slot.worker == worker) {
            Some((_, slot)) => {
                let _ = slot.reply.send(data);
                true
            }
            None => false,
        }
    }

    /// Drop a request without answering it.
    pub fn cancel(&self, id: RequestId) -> bool {
        self.slots.remove(&id).is_some()
    }

    /// Drop every request addressed to `worker`. Their futures resolve to
    /// [`SnapshotError::Abandoned`].
    pub fn abandon_worker(&self, worker: WorkerId) -> usize {
        let ids: Vec<RequestId> = self
            .slots
            .iter()
            .filter(|entry| entry.value().worker == worker)
            .map(|entry| *entry.key())
            .collect();
        ids.into_iter().filter(|id| self.cancel(*id)).count()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.slots.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Future of one snapshot request.
///
/// Dropping it before it settles removes the request from the pending map.
#[must_use = "a snapshot request does nothing unless awaited"]
pub struct PendingSnapshot {
    id: RequestId,
    worker: WorkerId,
    reply: oneshot::Receiver<Value>,
    requests: Arc<PendingRequests>,
    settled: bool,
}

impl PendingSnapshot {
    pub fn request_id(&self) -> RequestId {
        self.id
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Wait for the reply for at most `limit`.
    pub async fn timeout(self, limit: Duration) -> Result<Value, SnapshotError> {
        let request = self.id;
        match tokio::time::timeout(limit, self).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(request_id = %request, timeout = ?limit, "Snapshot request timed out");
                Err(SnapshotError::TimedOut {
                    request,
                    timeout: limit,
                })
            }
        }
    }
}

impl Future for PendingSnapshot {
    type Output = Result<Value, SnapshotError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.id;
        match Pin::new(&mut self.reply).poll(cx) {
            Poll::Ready(Ok(data)) => {
                self.settled = true;
                Poll::Ready(Ok(data))
            }
            Poll::Ready(Err(_)) => {
                self.settled = true;
                Poll::Ready(Err(SnapshotError::Abandoned(id)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl std::fmt::Debug for PendingSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingSnapshot")
            .field("id", &self.id)
            .field("worker", &self.worker)
            .field("settled", &self.settled)
            .finish()
    }
}

impl Drop for PendingSnapshot {
    fn drop(&mut self) {
        if !self.settled {
            self.requests.cancel(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resolves_once() {
        let requests = Arc::new(PendingRequests::new());
        let pending = requests.register(WorkerId(0));
        let id = pending.request_id();

        assert!(requests.resolve(WorkerId(0), id, json!(["X"])));
        assert!(!requests.resolve(WorkerId(0), id, json!(["Y"])));
        assert_eq!(pending.await.unwrap(), json!(["X"]));
        assert!(requests.is_empty());
    }

    #[tokio::test]
    async fn ids_are_shared_across_workers() {
        let requests = Arc::new(PendingRequests::new());
        let a = requests.register(WorkerId(0));
        let b = requests.register(WorkerId(1));
        assert_eq!(a.request_id(), RequestId(0));
        assert_eq!(b.request_id(), RequestId(1));
        assert_eq!(b.worker(), WorkerId(1));
    }

    #[tokio::test]
    async fn replies_from_another_worker_are_rejected() {
        let requests = Arc::new(PendingRequests::new());
        let pending = requests.register(WorkerId(0));
        let id = pending.request_id();

        assert!(!requests.resolve(WorkerId(1), id, json!("wrong")));
        assert!(requests.contains(id));
        assert!(requests.resolve(WorkerId(0), id, json!("right")));
        assert_eq!(pending.await.unwrap(), json!("right"));
    }

    #[tokio::test]
    async fn abandoning_a_worker_fails_its_requests() {
        let requests = Arc::new(PendingRequests::new());
        let first = requests.register(WorkerId(1));
        let other = requests.register(WorkerId(2));
        let second = requests.register(WorkerId(1));

        assert_eq!(requests.abandon_worker(WorkerId(1)), 2);
        assert!(matches!(first.await, Err(SnapshotError::Abandoned(RequestId(0)))));
        assert!(matches!(second.await, Err(SnapshotError::Abandoned(RequestId(2)))));
        assert!(requests.contains(other.request_id()));
    }

    #[tokio::test]
    async fn dropping_the_future_frees_the_slot() {
        let requests = Arc::new(PendingRequests::new());
        let pending = requests.register(WorkerId(0));
        assert_eq!(requests.len(), 1);
        drop(pending);
        assert!(requests.is_empty());
    }

    #[tokio::test]
    async fn timeout_frees_the_slot() {
        let requests = Arc::new(PendingRequests::new());
        let pending = requests.register(WorkerId(0));
        let err = pending.timeout(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, SnapshotError::TimedOut { request: RequestId(0), .. }));
        assert!(requests.is_empty());
    }
}
