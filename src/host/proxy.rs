//! Proxy handle standing in for a native worker handle.
//!
//! # Responsibilities
//! - Forward `post_message` and `terminate` to the owned native handle,
//!   bracketed by trace records
//! - Consume control messages before any application listener runs
//! - Subscribe to native events only while the application listens for them
//! - Issue snapshot requests and correlate their replies

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{json, Value};
use url::Url;

use crate::host::HostShared;
use crate::observability::metrics::{self, SIDE_HOST};
use crate::observability::Scope;
use crate::protocol::{
    is_control_event, Command, ControlMessage, PendingSnapshot, SnapshotError, SnapshotReply,
};
use crate::runtime::{
    EventListeners, EventTarget, EventType, Listener, ListenerId, NativeWorker, TransferList,
    WorkerEvent, WorkerId, WorkerResult,
};

/// Instrumented worker handle returned by [`Instrumentation`].
///
/// Clones share one underlying worker. The registry keeps a clone until the
/// worker is terminated or closes itself, so dropping every application
/// handle leaves the worker running and reachable through
/// [`Instrumentation::workers`].
///
/// [`Instrumentation`]: crate::host::Instrumentation
/// [`Instrumentation::workers`]: crate::host::Instrumentation::workers
#[derive(Clone)]
pub struct ProxyWorker {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    id: WorkerId,
    script_url: String,
    resolved_script_url: Url,
    native: Box<dyn NativeWorker>,
    shared: Arc<HostShared>,
    listeners: EventListeners,
    trackers: Mutex<HashMap<EventType, ListenerId>>,
    alive: AtomicBool,
}

impl ProxyWorker {
    /// Event types relayed from the native handle.
    pub const SUPPORTED_EVENTS: [EventType; 2] = [EventType::Error, EventType::Message];

    /// Wrap `native` and install the control filter as its first listener.
    pub(crate) fn attach(
        id: WorkerId,
        script_url: String,
        resolved_script_url: Url,
        native: Box<dyn NativeWorker>,
        shared: Arc<HostShared>,
    ) -> Self {
        let inner = Arc::new(ProxyInner {
            id,
            script_url,
            resolved_script_url,
            native,
            shared,
            listeners: EventListeners::new(),
            trackers: Mutex::new(HashMap::new()),
            alive: AtomicBool::new(true),
        });

        let weak = Arc::downgrade(&inner);
        inner.native.add_event_listener(
            EventType::Message,
            Arc::new(move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.intercept(event);
                }
            }),
        );

        Self { inner }
    }

    pub fn id(&self) -> WorkerId {
        self.inner.id
    }

    /// Script URL as the application passed it.
    pub fn script_url(&self) -> &str {
        &self.inner.script_url
    }

    pub fn resolved_script_url(&self) -> &Url {
        &self.inner.resolved_script_url
    }

    /// `false` once terminated or once the worker reported that it closed.
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    /// Subscribe the relay for `event_type` on the native handle.
    /// Does nothing if it is already subscribed.
    pub fn begin_tracking_event(&self, event_type: EventType) {
        let mut trackers = self.inner.lock_trackers();
        if trackers.contains_key(&event_type) {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let relay: Listener = Arc::new(move |event| {
            if is_control_event(event) {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                inner.relay(event);
            }
        });
        let id = self.inner.native.add_event_listener(event_type, relay);
        trackers.insert(event_type, id);
        tracing::trace!(worker_id = %self.inner.id, event_type = %event_type, "Tracking event");
    }

    /// Unsubscribe the relay for `event_type`, if subscribed.
    pub fn end_tracking_event(&self, event_type: EventType) {
        let removed = self.inner.lock_trackers().remove(&event_type);
        if let Some(id) = removed {
            self.inner.native.remove_event_listener(event_type, id);
            tracing::trace!(worker_id = %self.inner.id, event_type = %event_type, "Stopped tracking event");
        }
    }

    /// Event types currently relayed from the native handle.
    pub fn tracked_events(&self) -> Vec<EventType> {
        let trackers = self.inner.lock_trackers();
        Self::SUPPORTED_EVENTS
            .into_iter()
            .filter(|event_type| trackers.contains_key(event_type))
            .collect()
    }

    /// Ask the worker for a snapshot of its trace state.
    ///
    /// Returns as soon as the request is sent. The returned future resolves
    /// when the matching reply arrives, or fails with
    /// [`SnapshotError::Abandoned`] if the worker stops first.
    pub fn request_snapshot(&self) -> Result<PendingSnapshot, SnapshotError> {
        let pending = self.inner.shared.pending.register(self.inner.id);
        if !self.is_alive() {
            self.inner.shared.pending.cancel(pending.request_id());
            return Ok(pending);
        }

        let request = ControlMessage::snapshot_request(pending.request_id());
        self.inner.native.post_message(request.to_value(), Vec::new())?;
        metrics::record_snapshot_request();
        tracing::debug!(
            worker_id = %self.inner.id,
            request_id = %pending.request_id(),
            "Snapshot requested"
        );
        Ok(pending)
    }

    /// Request a snapshot and wait for it, up to the configured timeout.
    pub async fn snapshot(&self) -> Result<Value, SnapshotError> {
        let timeout = self.inner.shared.config.snapshot_timeout();
        self.request_snapshot()?.timeout(timeout).await
    }
}

impl ProxyInner {
    fn lock_trackers(&self) -> MutexGuard<'_, HashMap<EventType, ListenerId>> {
        self.trackers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn id_arg(&self) -> Value {
        json!(self.id.as_u32())
    }

    fn relay(&self, event: &WorkerEvent) {
        let scope = Scope::enter(
            self.shared.sink.as_ref(),
            "worker.dispatch",
            vec![("type", json!(event.event_type().as_str()))],
        );
        scope.append(vec![("id", self.id_arg())]);
        self.listeners.dispatch(event);
    }

    fn intercept(&self, event: &WorkerEvent) {
        let Some(message) = event.message_data().and_then(ControlMessage::sniff) else {
            return;
        };
        metrics::record_control_message(SIDE_HOST, message.command.as_str());

        match message.command {
            Command::Snapshot => match message.decode::<SnapshotReply>() {
                Ok(reply) => {
                    if !self.shared.pending.resolve(self.id, reply.id, reply.data) {
                        metrics::record_unmatched_reply();
                        tracing::debug!(
                            worker_id = %self.id,
                            request_id = %reply.id,
                            "Ignoring snapshot reply with no pending request"
                        );
                    }
                }
                Err(err) => {
                    tracing::debug!(worker_id = %self.id, error = %err, "Ignoring malformed snapshot reply");
                }
            },
            Command::Close => self.closed(),
            Command::Unknown => {
                tracing::debug!(worker_id = %self.id, "Ignoring unknown control command");
            }
        }
    }

    fn closed(&self) {
        let removed = self.shared.registry.remove(self.id);
        self.alive.store(false, Ordering::SeqCst);
        let abandoned = self.shared.pending.abandon_worker(self.id);
        if removed {
            metrics::record_termination("close");
        }
        tracing::debug!(worker_id = %self.id, abandoned, "Worker closed itself");
    }
}

impl EventTarget for ProxyWorker {
    fn add_event_listener(&self, event_type: EventType, listener: Listener) -> ListenerId {
        let (id, first) = self.inner.listeners.add(event_type, listener);
        if first && Self::SUPPORTED_EVENTS.contains(&event_type) {
            self.begin_tracking_event(event_type);
        }
        id
    }

    fn remove_event_listener(&self, event_type: EventType, id: ListenerId) -> bool {
        match self.inner.listeners.remove(event_type, id) {
            Some(last) => {
                if last {
                    self.end_tracking_event(event_type);
                }
                true
            }
            None => false,
        }
    }

    fn dispatch_event(&self, event: &WorkerEvent) {
        self.inner.listeners.dispatch(event);
    }
}

impl NativeWorker for ProxyWorker {
    fn post_message(&self, message: Value, transfer: TransferList) -> WorkerResult<()> {
        let _scope = Scope::enter(
            self.inner.shared.sink.as_ref(),
            "worker.post_message",
            vec![("id", self.inner.id_arg())],
        );
        self.inner.native.post_message(message, transfer)?;
        metrics::record_message_posted(SIDE_HOST);
        Ok(())
    }

    fn terminate(&self) -> WorkerResult<()> {
        let inner = &self.inner;
        let removed = inner.shared.registry.remove(inner.id);
        let was_alive = inner.alive.swap(false, Ordering::SeqCst);
        let abandoned = inner.shared.pending.abandon_worker(inner.id);

        inner.shared.sink.instant("worker.terminate", vec![("id", inner.id_arg())]);
        if was_alive {
            metrics::record_termination("terminate");
        }
        tracing::debug!(worker_id = %inner.id, removed, abandoned, "Terminating worker");

        inner.native.terminate()
    }
}

impl fmt::Debug for ProxyWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyWorker")
            .field("id", &self.inner.id)
            .field("script_url", &self.inner.script_url)
            .field("alive", &self.is_alive())
            .finish()
    }
}
