//! In-process worker runtime.
//!
//! Workers created by a [`LoopbackHost`] run on the thread that pumps the
//! host. Each worker owns one FIFO queue per direction, and nothing moves
//! until [`LoopbackHost::run_until_idle`] is called, which plays the part of
//! the event loop: a worker boots on its first turn, then drains messages.
//!
//! Scripts are Rust closures registered under a URL. Object URLs serve
//! bootstrap programs, which are parsed and executed statement by statement.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, Weak};

use serde_json::Value;
use url::Url;

use crate::bootstrap::BootstrapProgram;
use crate::runtime::{
    resolve_script_url, ErrorEvent, EventListeners, EventTarget, EventType, Listener, ListenerId,
    MessageEvent, NativeWorker, TraceRuntime, TransferList, WorkerContext, WorkerError,
    WorkerEvent, WorkerHost, WorkerOptions, WorkerResult, WorkerScope,
};

/// A script body.
pub type Script = Arc<dyn Fn(&WorkerContext) -> WorkerResult<()> + Send + Sync>;

/// Builds a fresh tracing runtime for each context that imports it.
pub type RuntimeFactory = Arc<dyn Fn(&Url) -> Arc<dyn TraceRuntime> + Send + Sync>;

#[derive(Clone)]
enum ScriptEntry {
    Script(Script),
    Runtime(RuntimeFactory),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Shared {
    scripts: RwLock<HashMap<Url, ScriptEntry>>,
    object_urls: Mutex<HashMap<Url, String>>,
    channels: Mutex<Vec<Arc<Channel>>>,
    next_object_url: AtomicU64,
    next_channel: AtomicU64,
}

impl Shared {
    fn run_script(&self, url: &Url, ctx: &WorkerContext) -> WorkerResult<()> {
        let entry = self
            .scripts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
            .ok_or_else(|| WorkerError::ScriptNotFound(url.to_string()))?;

        match entry {
            ScriptEntry::Script(script) => script(ctx),
            ScriptEntry::Runtime(factory) => {
                ctx.bind_runtime(factory(url));
                Ok(())
            }
        }
    }
}

/// Creation entry point of the loopback runtime.
#[derive(Clone)]
pub struct LoopbackHost {
    location: Url,
    shared: Arc<Shared>,
}

impl LoopbackHost {
    pub fn new(location: Url) -> Self {
        Self {
            location,
            shared: Arc::new(Shared::default()),
        }
    }

    fn with_location(&self, location: Url) -> Self {
        Self {
            location,
            shared: self.shared.clone(),
        }
    }

    /// Serve `script` at `url` (resolved against this host's location).
    pub fn register_script<F>(&self, url: &str, script: F) -> WorkerResult<Url>
    where
        F: Fn(&WorkerContext) -> WorkerResult<()> + Send + Sync + 'static,
    {
        self.register(url, ScriptEntry::Script(Arc::new(script)))
    }

    /// Serve a tracing runtime at `url`. Importing it binds a new runtime
    /// instance to the importing context.
    pub fn register_runtime<F>(&self, url: &str, factory: F) -> WorkerResult<Url>
    where
        F: Fn(&Url) -> Arc<dyn TraceRuntime> + Send + Sync + 'static,
    {
        self.register(url, ScriptEntry::Runtime(Arc::new(factory)))
    }

    fn register(&self, url: &str, entry: ScriptEntry) -> WorkerResult<Url> {
        let url = resolve_script_url(&self.location, url)?;
        self.shared
            .scripts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.clone(), entry);
        Ok(url)
    }

    /// Run dispatch loop turns until no worker has pending work.
    /// Returns the number of steps executed.
    pub fn run_until_idle(&self) -> usize {
        let mut steps = 0;
        loop {
            let channels: Vec<Arc<Channel>> = lock(&self.shared.channels).clone();
            let mut progressed = false;

            for channel in &channels {
                while let Some(step) = channel.next_step() {
                    channel.run(step);
                    steps += 1;
                    progressed = true;
                }
            }

            lock(&self.shared.channels).retain(|channel| !channel.is_finished());
            if !progressed {
                return steps;
            }
        }
    }

    /// Workers that have neither closed nor been terminated.
    pub fn live_workers(&self) -> usize {
        lock(&self.shared.channels)
            .iter()
            .filter(|channel| channel.is_live())
            .count()
    }

    /// Object URLs that have not been revoked.
    pub fn object_url_count(&self) -> usize {
        lock(&self.shared.object_urls).len()
    }
}

impl WorkerHost for LoopbackHost {
    fn location(&self) -> &Url {
        &self.location
    }

    fn create_worker(
        &self,
        script_url: &str,
        options: &WorkerOptions,
    ) -> WorkerResult<Box<dyn NativeWorker>> {
        let entry = resolve_script_url(&self.location, script_url)?;
        let source = if entry.scheme() == "blob" {
            let text = lock(&self.shared.object_urls)
                .get(&entry)
                .cloned()
                .ok_or_else(|| WorkerError::Spawn {
                    url: entry.to_string(),
                    reason: "object URL is not registered".to_string(),
                })?;
            Source::Program(text)
        } else {
            Source::Script
        };

        let id = self.shared.next_channel.fetch_add(1, Ordering::Relaxed);
        let channel = Arc::new(Channel {
            id,
            name: options.name.clone(),
            host: self.with_location(entry.clone()),
            entry,
            source,
            state: Mutex::new(ChannelState {
                phase: Phase::Pending,
                to_worker: VecDeque::new(),
                to_host: VecDeque::new(),
            }),
            host_listeners: EventListeners::new(),
            scope: OnceLock::new(),
            context: OnceLock::new(),
        });
        tracing::trace!(channel = id, url = %channel.entry, name = ?channel.name, "Loopback worker created");

        lock(&self.shared.channels).push(channel.clone());
        Ok(Box::new(LoopbackWorker { channel }))
    }

    fn create_object_url(&self, source: String, content_type: &str) -> WorkerResult<Url> {
        let n = self.shared.next_object_url.fetch_add(1, Ordering::Relaxed);
        let raw = format!("blob:{}/{}", self.location.origin().ascii_serialization(), n);
        let url = Url::parse(&raw).map_err(|source| WorkerError::InvalidUrl { url: raw, source })?;
        tracing::trace!(url = %url, content_type, bytes = source.len(), "Object URL created");
        lock(&self.shared.object_urls).insert(url.clone(), source);
        Ok(url)
    }

    fn revoke_object_url(&self, url: &Url) {
        lock(&self.shared.object_urls).remove(url);
    }
}

enum Source {
    Program(String),
    Script,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Running,
    Closed,
    Terminated,
}

struct ChannelState {
    phase: Phase,
    to_worker: VecDeque<MessageEvent>,
    to_host: VecDeque<WorkerEvent>,
}

enum Step {
    Boot,
    ToWorker(MessageEvent),
    ToHost(WorkerEvent),
}

/// One worker: its queues, both listener sets and the booted context.
struct Channel {
    id: u64,
    name: Option<String>,
    entry: Url,
    source: Source,
    host: LoopbackHost,
    state: Mutex<ChannelState>,
    host_listeners: EventListeners,
    scope: OnceLock<Arc<LoopbackScope>>,
    context: OnceLock<Arc<WorkerContext>>,
}

impl Channel {
    fn next_step(&self) -> Option<Step> {
        let mut state = lock(&self.state);
        match state.phase {
            Phase::Pending => {
                state.phase = Phase::Running;
                return Some(Step::Boot);
            }
            Phase::Running => {
                if let Some(message) = state.to_worker.pop_front() {
                    return Some(Step::ToWorker(message));
                }
            }
            Phase::Terminated => return None,
            Phase::Closed => {}
        }
        state.to_host.pop_front().map(Step::ToHost)
    }

    fn run(self: &Arc<Self>, step: Step) {
        match step {
            Step::Boot => self.boot(),
            Step::ToWorker(message) => {
                if let Some(scope) = self.scope.get() {
                    scope.listeners.dispatch(&WorkerEvent::Message(message));
                }
            }
            Step::ToHost(event) => {
                self.host_listeners.dispatch(&event);
            }
        }
    }

    fn boot(self: &Arc<Self>) {
        let scope = Arc::new(LoopbackScope {
            channel: Arc::downgrade(self),
            location: self.entry.clone(),
            host: self.host.clone(),
            globals: Mutex::new(HashMap::new()),
            listeners: EventListeners::new(),
            context: OnceLock::new(),
        });
        let context = Arc::new(WorkerContext::new(scope.clone()));
        let _ = scope.context.set(Arc::downgrade(&context));
        let _ = self.scope.set(scope);
        let _ = self.context.set(context.clone());

        let result = match &self.source {
            Source::Program(text) => BootstrapProgram::parse(text)
                .map_err(|e| WorkerError::Bootstrap(e.to_string()))
                .and_then(|program| program.execute(&context)),
            Source::Script => self.host.shared.run_script(&self.entry, &context),
        };

        if let Err(err) = result {
            tracing::debug!(channel = self.id, url = %self.entry, error = %err, "Worker failed to boot");
            self.push_to_host(WorkerEvent::Error(ErrorEvent {
                message: err.to_string(),
                filename: self.entry.to_string(),
                ..Default::default()
            }));
        }
    }

    fn push_to_host(&self, event: WorkerEvent) {
        let mut state = lock(&self.state);
        if state.phase != Phase::Terminated {
            state.to_host.push_back(event);
        }
    }

    fn is_live(&self) -> bool {
        matches!(lock(&self.state).phase, Phase::Pending | Phase::Running)
    }

    fn is_finished(&self) -> bool {
        let state = lock(&self.state);
        match state.phase {
            Phase::Terminated => true,
            Phase::Closed => state.to_host.is_empty(),
            Phase::Pending | Phase::Running => false,
        }
    }
}

/// Host end of a loopback worker.
pub struct LoopbackWorker {
    channel: Arc<Channel>,
}

impl EventTarget for LoopbackWorker {
    fn add_event_listener(&self, event_type: EventType, listener: Listener) -> ListenerId {
        self.channel.host_listeners.add(event_type, listener).0
    }

    fn remove_event_listener(&self, event_type: EventType, id: ListenerId) -> bool {
        self.channel.host_listeners.remove(event_type, id).is_some()
    }

    fn dispatch_event(&self, event: &WorkerEvent) {
        self.channel.host_listeners.dispatch(event);
    }
}

impl NativeWorker for LoopbackWorker {
    fn post_message(&self, message: Value, transfer: TransferList) -> WorkerResult<()> {
        let mut state = lock(&self.channel.state);
        match state.phase {
            Phase::Pending | Phase::Running => {
                state.to_worker.push_back(MessageEvent::new(message, transfer));
            }
            Phase::Closed | Phase::Terminated => {
                tracing::trace!(channel = self.channel.id, "Message to stopped worker dropped");
            }
        }
        Ok(())
    }

    fn terminate(&self) -> WorkerResult<()> {
        let mut state = lock(&self.channel.state);
        state.phase = Phase::Terminated;
        state.to_worker.clear();
        state.to_host.clear();
        Ok(())
    }
}

/// Worker end of a loopback worker.
struct LoopbackScope {
    channel: Weak<Channel>,
    location: Url,
    host: LoopbackHost,
    globals: Mutex<HashMap<String, Value>>,
    listeners: EventListeners,
    context: OnceLock<Weak<WorkerContext>>,
}

impl EventTarget for LoopbackScope {
    fn add_event_listener(&self, event_type: EventType, listener: Listener) -> ListenerId {
        self.listeners.add(event_type, listener).0
    }

    fn remove_event_listener(&self, event_type: EventType, id: ListenerId) -> bool {
        self.listeners.remove(event_type, id).is_some()
    }

    fn dispatch_event(&self, event: &WorkerEvent) {
        self.listeners.dispatch(event);
    }
}

impl WorkerScope for LoopbackScope {
    fn location(&self) -> &Url {
        &self.location
    }

    fn import_scripts(&self, urls: &[&str]) -> WorkerResult<()> {
        let resolved = urls
            .iter()
            .map(|url| resolve_script_url(&self.location, url))
            .collect::<WorkerResult<Vec<_>>>()?;
        let context = self
            .context
            .get()
            .and_then(Weak::upgrade)
            .ok_or(WorkerError::Closed)?;

        for url in &resolved {
            self.host.shared.run_script(url, &context)?;
        }
        Ok(())
    }

    fn post_message(&self, message: Value, transfer: TransferList) -> WorkerResult<()> {
        let channel = self.channel.upgrade().ok_or(WorkerError::Closed)?;
        let mut state = lock(&channel.state);
        if state.phase == Phase::Running {
            state
                .to_host
                .push_back(WorkerEvent::Message(MessageEvent::new(message, transfer)));
        }
        Ok(())
    }

    fn close(&self) {
        if let Some(channel) = self.channel.upgrade() {
            let mut state = lock(&channel.state);
            if state.phase != Phase::Terminated {
                state.phase = Phase::Closed;
                state.to_worker.clear();
            }
        }
    }

    fn global(&self, name: &str) -> Option<Value> {
        lock(&self.globals).get(name).cloned()
    }

    fn set_global(&self, name: &str, value: Value) {
        lock(&self.globals).insert(name.to_string(), value);
    }

    fn host(&self) -> Option<Arc<dyn WorkerHost>> {
        Some(Arc::new(self.host.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn host() -> LoopbackHost {
        LoopbackHost::new(Url::parse("https://example.com/app/").unwrap())
    }

    fn collect(worker: &dyn NativeWorker, event_type: EventType) -> Arc<Mutex<Vec<WorkerEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        worker.add_event_listener(
            event_type,
            Arc::new(move |event| sink.lock().unwrap().push(event.clone())),
        );
        seen
    }

    fn register_echo(host: &LoopbackHost) {
        host.register_script("echo.js", |ctx| {
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
        })
        .unwrap();
    }

    #[test]
    fn queues_until_booted_and_keeps_order() {
        let host = host();
        register_echo(&host);

        let worker = host.create_worker("echo.js", &WorkerOptions::default()).unwrap();
        let seen = collect(worker.as_ref(), EventType::Message);
        for n in 0..3 {
            worker.post_message(json!(n), Vec::new()).unwrap();
        }
        assert!(seen.lock().unwrap().is_empty());

        host.run_until_idle();
        let data: Vec<Value> = seen
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| e.message_data().cloned())
            .collect();
        assert_eq!(data, vec![json!({"echo": 0}), json!({"echo": 1}), json!({"echo": 2})]);
    }

    #[test]
    fn missing_script_reports_error_event() {
        let host = host();
        let worker = host.create_worker("missing.js", &WorkerOptions::default()).unwrap();
        let errors = collect(worker.as_ref(), EventType::Error);

        host.run_until_idle();
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        match &errors[0] {
            WorkerEvent::Error(e) => assert!(e.message.contains("script not found")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn terminate_stops_delivery() {
        let host = host();
        register_echo(&host);

        let worker = host.create_worker("echo.js", &WorkerOptions::default()).unwrap();
        let seen = collect(worker.as_ref(), EventType::Message);
        host.run_until_idle();
        assert_eq!(host.live_workers(), 1);

        worker.post_message(json!("late"), Vec::new()).unwrap();
        worker.terminate().unwrap();
        host.run_until_idle();

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(host.live_workers(), 0);
    }

    #[test]
    fn revoked_object_url_cannot_spawn() {
        let host = host();
        let url = host
            .create_object_url("tracer.start();".to_string(), "text/javascript")
            .unwrap();
        assert_eq!(url.scheme(), "blob");
        assert_eq!(host.object_url_count(), 1);

        host.revoke_object_url(&url);
        assert_eq!(host.object_url_count(), 0);
        let err = host
            .create_worker(url.as_str(), &WorkerOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, WorkerError::Spawn { .. }));
    }

    #[test]
    fn relative_import_from_object_url_fails() {
        let host = host();
        host.register_script("helper.js", |_| Ok(())).unwrap();
        let outcome = Arc::new(Mutex::new(None));
        let slot = outcome.clone();
        host.register_runtime("stub-runtime.js", move |_| {
            *slot.lock().unwrap() = Some(());
            Arc::new(Noop) as Arc<dyn TraceRuntime>
        })
        .unwrap();

        let program = "importScripts(\"https://example.com/app/stub-runtime.js\");\nimportScripts(\"helper.js\");\n";
        let url = host
            .create_object_url(program.to_string(), "text/javascript")
            .unwrap();
        let worker = host.create_worker(url.as_str(), &WorkerOptions::default()).unwrap();
        let errors = collect(worker.as_ref(), EventType::Error);
        host.run_until_idle();

        assert!(outcome.lock().unwrap().is_some());
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    struct Noop;

    impl TraceRuntime for Noop {
        fn prepare(&self, _ctx: &WorkerContext, _options: &Value) -> WorkerResult<()> {
            Ok(())
        }

        fn start(&self, _ctx: &WorkerContext) -> WorkerResult<()> {
            Ok(())
        }
    }
}
