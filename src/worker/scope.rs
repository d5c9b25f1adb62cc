//! Instrumented worker global scope.
//!
//! Wraps the native scope of a worker context. Imports are resolved against
//! the base location recorded by the bootstrap program, `close` notifies the
//! host before the context stops, and inbound snapshot requests are answered
//! without reaching application listeners.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::{json, Value};
use url::Url;

use crate::observability::metrics::{self, SIDE_WORKER};
use crate::observability::{Scope, TraceSink};
use crate::protocol::{is_control_event, Command, ControlMessage, SnapshotRequest};
use crate::runtime::{
    resolve_script_url, EventListeners, EventTarget, EventType, Listener, ListenerId,
    TransferList, WorkerEvent, WorkerHost, WorkerId, WorkerResult, WorkerScope,
};

pub struct InstrumentedScope {
    native: Arc<dyn WorkerScope>,
    worker_id: WorkerId,
    base: Url,
    sink: Arc<dyn TraceSink>,
    listeners: EventListeners,
    trackers: Mutex<HashMap<EventType, ListenerId>>,
    this: Weak<InstrumentedScope>,
}

impl InstrumentedScope {
    /// Event types relayed from the native scope.
    pub const SUPPORTED_EVENTS: [EventType; 4] = [
        EventType::Error,
        EventType::Online,
        EventType::Offline,
        EventType::Message,
    ];

    /// Wrap `native` and install the control filter as its first message
    /// listener.
    pub fn install(
        native: Arc<dyn WorkerScope>,
        worker_id: WorkerId,
        base: Url,
        sink: Arc<dyn TraceSink>,
    ) -> Arc<Self> {
        let scope = Arc::new_cyclic(|this: &Weak<Self>| Self {
            native,
            worker_id,
            base,
            sink,
            listeners: EventListeners::new(),
            trackers: Mutex::new(HashMap::new()),
            this: this.clone(),
        });

        let weak = Arc::downgrade(&scope);
        scope.native.add_event_listener(
            EventType::Message,
            Arc::new(move |event| {
                if let Some(scope) = weak.upgrade() {
                    scope.intercept(event);
                }
            }),
        );
        tracing::debug!(worker_id = %worker_id, base = %scope.base, "Worker scope instrumented");
        scope
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Location imports are resolved against.
    pub fn base_location(&self) -> &Url {
        &self.base
    }

    pub fn begin_tracking_event(&self, event_type: EventType) {
        let mut trackers = self.lock_trackers();
        if trackers.contains_key(&event_type) {
            return;
        }

        let weak = self.this.clone();
        let relay: Listener = Arc::new(move |event| {
            if is_control_event(event) {
                return;
            }
            if let Some(scope) = weak.upgrade() {
                scope.relay(event);
            }
        });
        let id = self.native.add_event_listener(event_type, relay);
        trackers.insert(event_type, id);
    }

    pub fn end_tracking_event(&self, event_type: EventType) {
        let removed = self.lock_trackers().remove(&event_type);
        if let Some(id) = removed {
            self.native.remove_event_listener(event_type, id);
        }
    }

    pub fn tracked_events(&self) -> Vec<EventType> {
        let trackers = self.lock_trackers();
        Self::SUPPORTED_EVENTS
            .into_iter()
            .filter(|event_type| trackers.contains_key(event_type))
            .collect()
    }

    fn lock_trackers(&self) -> MutexGuard<'_, HashMap<EventType, ListenerId>> {
        self.trackers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn relay(&self, event: &WorkerEvent) {
        let _scope = Scope::enter(
            self.sink.as_ref(),
            "scope.dispatch",
            vec![("type", json!(event.event_type().as_str()))],
        );
        self.listeners.dispatch(event);
    }

    fn intercept(&self, event: &WorkerEvent) {
        let Some(message) = event.message_data().and_then(ControlMessage::sniff) else {
            return;
        };
        metrics::record_control_message(SIDE_WORKER, message.command.as_str());

        match message.command {
            Command::Snapshot => match message.decode::<SnapshotRequest>() {
                Ok(request) => self.reply_snapshot(request),
                Err(err) => {
                    tracing::debug!(worker_id = %self.worker_id, error = %err, "Ignoring malformed snapshot request");
                }
            },
            Command::Close | Command::Unknown => {
                tracing::debug!(
                    worker_id = %self.worker_id,
                    command = message.command.as_str(),
                    "Ignoring control command"
                );
            }
        }
    }

    fn reply_snapshot(&self, request: SnapshotRequest) {
        let data = self.sink.snapshot();
        let reply = ControlMessage::snapshot_reply(request.id, data);
        if let Err(err) = self.native.post_message(reply.to_value(), Vec::new()) {
            tracing::warn!(
                worker_id = %self.worker_id,
                request_id = %request.id,
                error = %err,
                "Failed to send snapshot reply"
            );
        }
    }
}

impl EventTarget for InstrumentedScope {
    fn add_event_listener(&self, event_type: EventType, listener: Listener) -> ListenerId {
        let (id, first) = self.listeners.add(event_type, listener);
        if first {
            self.begin_tracking_event(event_type);
        }
        id
    }

    fn remove_event_listener(&self, event_type: EventType, id: ListenerId) -> bool {
        match self.listeners.remove(event_type, id) {
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
        self.listeners.dispatch(event);
    }
}

impl WorkerScope for InstrumentedScope {
    fn location(&self) -> &Url {
        self.native.location()
    }

    fn import_scripts(&self, urls: &[&str]) -> WorkerResult<()> {
        let resolved = urls
            .iter()
            .map(|url| resolve_script_url(&self.base, url))
            .collect::<WorkerResult<Vec<_>>>()?;
        let listed: Vec<Value> = resolved.iter().map(|url| json!(url.as_str())).collect();

        let _scope = Scope::enter(
            self.sink.as_ref(),
            "scope.import_scripts",
            vec![("urls", Value::Array(listed))],
        );
        let refs: Vec<&str> = resolved.iter().map(Url::as_str).collect();
        self.native.import_scripts(&refs)
    }

    fn post_message(&self, message: Value, transfer: TransferList) -> WorkerResult<()> {
        let _scope = Scope::enter(self.sink.as_ref(), "scope.post_message", Vec::new());
        self.native.post_message(message, transfer)?;
        metrics::record_message_posted(SIDE_WORKER);
        Ok(())
    }

    fn close(&self) {
        self.sink.instant("scope.close", Vec::new());
        if let Err(err) = self
            .native
            .post_message(ControlMessage::close().to_value(), Vec::new())
        {
            tracing::debug!(worker_id = %self.worker_id, error = %err, "Failed to send close notification");
        }
        self.native.close();
    }

    fn global(&self, name: &str) -> Option<Value> {
        self.native.global(name)
    }

    fn set_global(&self, name: &str, value: Value) {
        self.native.set_global(name, value);
    }

    fn host(&self) -> Option<Arc<dyn WorkerHost>> {
        self.native.host()
    }
}
