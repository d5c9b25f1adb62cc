//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use url::Url;

use worker_tracer::config::InstrumentationConfig;
use worker_tracer::runtime::loopback::LoopbackHost;
use worker_tracer::runtime::{
    EventListeners, EventTarget, EventType, Listener, ListenerId, MessageEvent, NativeWorker,
    TransferList, WorkerContext, WorkerError, WorkerEvent, WorkerHost, WorkerOptions,
    WorkerResult,
};
use worker_tracer::{Instrumentation, TraceBuffer, WorkerTracer};

pub const BASE: &str = "https://example.com/app/";

pub fn base() -> Url {
    Url::parse(BASE).unwrap()
}

/// Record every event of `event_type` delivered to `target`.
pub fn collect<T: EventTarget + ?Sized>(
    target: &T,
    event_type: EventType,
) -> Arc<Mutex<Vec<WorkerEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    target.add_event_listener(
        event_type,
        Arc::new(move |event| sink.lock().unwrap().push(event.clone())),
    );
    seen
}

/// Message payloads among recorded events.
pub fn payloads(seen: &Arc<Mutex<Vec<WorkerEvent>>>) -> Vec<Value> {
    seen.lock()
        .unwrap()
        .iter()
        .filter_map(|event| event.message_data().cloned())
        .collect()
}

pub fn message(data: Value) -> WorkerEvent {
    WorkerEvent::Message(MessageEvent::new(data, Vec::new()))
}

// ---------------------------------------------------------------------------
// Recording native double
// ---------------------------------------------------------------------------

/// Native worker state visible to tests.
#[derive(Default)]
pub struct FakeWorkerState {
    pub listeners: EventListeners,
    pub posted: Mutex<Vec<(Value, TransferList)>>,
    pub terminations: AtomicUsize,
    pub fail_post: AtomicBool,
}

impl FakeWorkerState {
    /// Deliver an event as if the worker had sent it.
    pub fn emit(&self, event: WorkerEvent) {
        self.listeners.dispatch(&event);
    }

    pub fn emit_message(&self, data: Value) {
        self.emit(message(data));
    }

    pub fn posted(&self) -> Vec<(Value, TransferList)> {
        self.posted.lock().unwrap().clone()
    }

    pub fn last_posted(&self) -> Value {
        self.posted.lock().unwrap().last().unwrap().0.clone()
    }
}

struct FakeWorker {
    state: Arc<FakeWorkerState>,
}

impl EventTarget for FakeWorker {
    fn add_event_listener(&self, event_type: EventType, listener: Listener) -> ListenerId {
        self.state.listeners.add(event_type, listener).0
    }

    fn remove_event_listener(&self, event_type: EventType, id: ListenerId) -> bool {
        self.state.listeners.remove(event_type, id).is_some()
    }

    fn dispatch_event(&self, event: &WorkerEvent) {
        self.state.listeners.dispatch(event);
    }
}

impl NativeWorker for FakeWorker {
    fn post_message(&self, message: Value, transfer: TransferList) -> WorkerResult<()> {
        if self.state.fail_post.load(Ordering::SeqCst) {
            return Err(WorkerError::PostMessage("channel broken".to_string()));
        }
        self.state.posted.lock().unwrap().push((message, transfer));
        Ok(())
    }

    fn terminate(&self) -> WorkerResult<()> {
        self.state.terminations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Native host that records everything and can be told to fail.
pub struct FakeHost {
    location: Url,
    pub fail_create: AtomicBool,
    pub created: Mutex<Vec<(String, Arc<FakeWorkerState>)>>,
    pub object_urls: Mutex<Vec<(Url, String)>>,
    pub revoked: Mutex<Vec<Url>>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            location: base(),
            fail_create: AtomicBool::new(false),
            created: Mutex::new(Vec::new()),
            object_urls: Mutex::new(Vec::new()),
            revoked: Mutex::new(Vec::new()),
        })
    }

    /// State of the `index`-th native worker created.
    pub fn worker(&self, index: usize) -> Arc<FakeWorkerState> {
        self.created.lock().unwrap()[index].1.clone()
    }

    /// URL the `index`-th native worker was created with.
    pub fn created_url(&self, index: usize) -> String {
        self.created.lock().unwrap()[index].0.clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    /// Source text served at the `index`-th object URL.
    pub fn object_source(&self, index: usize) -> String {
        self.object_urls.lock().unwrap()[index].1.clone()
    }

    pub fn object_url_count(&self) -> usize {
        self.object_urls.lock().unwrap().len()
    }
}

impl WorkerHost for FakeHost {
    fn location(&self) -> &Url {
        &self.location
    }

    fn create_worker(
        &self,
        script_url: &str,
        _options: &WorkerOptions,
    ) -> WorkerResult<Box<dyn NativeWorker>> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(WorkerError::Spawn {
                url: script_url.to_string(),
                reason: "refused".to_string(),
            });
        }
        let state = Arc::new(FakeWorkerState::default());
        self.created
            .lock()
            .unwrap()
            .push((script_url.to_string(), state.clone()));
        Ok(Box::new(FakeWorker { state }))
    }

    fn create_object_url(&self, source: String, _content_type: &str) -> WorkerResult<Url> {
        let mut urls = self.object_urls.lock().unwrap();
        let url = Url::parse(&format!("blob:https://example.com/{}", urls.len())).unwrap();
        urls.push((url.clone(), source));
        Ok(url)
    }

    fn revoke_object_url(&self, url: &Url) {
        self.revoked.lock().unwrap().push(url.clone());
    }
}

/// Instrumentation over a fresh [`FakeHost`].
pub fn fake_instrumentation(
    config: InstrumentationConfig,
) -> (Arc<FakeHost>, Arc<TraceBuffer>, Instrumentation) {
    let host = FakeHost::new();
    let sink = Arc::new(TraceBuffer::new(256));
    let instrumentation = Instrumentation::new(config, host.clone(), sink.clone(), base()).unwrap();
    (host, sink, instrumentation)
}

/// A snapshot reply as the worker side would send it.
pub fn snapshot_reply(id: u64, data: Value) -> Value {
    json!({ "isControl": true, "command": "snapshot", "value": { "id": id, "data": data } })
}

// ---------------------------------------------------------------------------
// Loopback harness
// ---------------------------------------------------------------------------

pub struct Loopback {
    pub host: LoopbackHost,
    pub sink: Arc<TraceBuffer>,
    pub instrumentation: Instrumentation,
}

/// Loopback runtime serving the tracing runtime at `tracer.js` and an echo
/// worker at `echo.js`, wrapped by an instrumentation using `config`.
pub fn loopback(config: InstrumentationConfig) -> Loopback {
    let host = LoopbackHost::new(base());
    host.register_runtime(&config.tracing_runtime_url, WorkerTracer::factory(config.clone()))
        .unwrap();
    host.register_script("echo.js", echo_script).unwrap();

    let sink = Arc::new(TraceBuffer::new(1024));
    let instrumentation =
        Instrumentation::new(config, Arc::new(host.clone()), sink.clone(), base()).unwrap();
    Loopback {
        host,
        sink,
        instrumentation,
    }
}

/// Replies to every message with `{"echo": <data>}`.
pub fn echo_script(ctx: &WorkerContext) -> WorkerResult<()> {
    let scope = Arc::downgrade(&ctx.scope());
    ctx.scope().add_event_listener(
        EventType::Message,
        Arc::new(move |event| {
            if let (Some(scope), Some(data)) = (scope.upgrade(), event.message_data()) {
                scope.post_message(json!({ "echo": data }), Vec::new()).unwrap();
            }
        }),
    );
    Ok(())
}

/// Names of the records in a snapshot payload.
pub fn record_names(snapshot: &Value) -> Vec<String> {
    snapshot
        .as_array()
        .unwrap()
        .iter()
        .map(|record| record["name"].as_str().unwrap().to_string())
        .collect()
}
