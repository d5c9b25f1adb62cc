//! Native worker runtime abstractions.
//!
//! # Data Flow
//! ```text
//! Host context                                  Worker context
//!   WorkerHost::create_worker(url)
//!     → NativeWorker ──── post_message ────▶   WorkerScope listeners
//!       listeners    ◀─── post_message ─────   WorkerScope
//! ```
//!
//! The traits here are the surface the instrumentation wraps. The
//! instrumented types implement the same traits, so application code cannot
//! tell a wrapped handle from a native one.
//!
//! `loopback` provides an in-process implementation driven by an explicit
//! dispatch loop.

pub mod context;
pub mod events;
pub mod location;
pub mod loopback;
pub mod types;

use serde_json::Value;
use std::sync::Arc;
use url::Url;

pub use context::WorkerContext;
pub use events::EventListeners;
pub use location::resolve_script_url;
pub use types::{
    ErrorEvent, EventType, Listener, ListenerId, MessageEvent, TransferList, WorkerError,
    WorkerEvent, WorkerId, WorkerResult,
};

/// Listener registration and dispatch.
pub trait EventTarget: Send + Sync {
    fn add_event_listener(&self, event_type: EventType, listener: Listener) -> ListenerId;

    /// Returns `false` if the listener was not registered.
    fn remove_event_listener(&self, event_type: EventType, id: ListenerId) -> bool;

    fn dispatch_event(&self, event: &WorkerEvent);
}

/// Handle to a running worker, held by the context that created it.
pub trait NativeWorker: EventTarget {
    fn post_message(&self, message: Value, transfer: TransferList) -> WorkerResult<()>;

    fn terminate(&self) -> WorkerResult<()>;
}

/// How the worker's entry script is loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScriptKind {
    #[default]
    Classic,
    Module,
}

/// Construction options accepted by [`WorkerHost::create_worker`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerOptions {
    pub name: Option<String>,
    pub kind: ScriptKind,
}

/// The worker creation entry point of an execution context.
pub trait WorkerHost: Send + Sync {
    /// Location relative script URLs are resolved against.
    fn location(&self) -> &Url;

    fn create_worker(
        &self,
        script_url: &str,
        options: &WorkerOptions,
    ) -> WorkerResult<Box<dyn NativeWorker>>;

    /// Serve `source` from a fresh object URL.
    fn create_object_url(&self, source: String, content_type: &str) -> WorkerResult<Url>;

    fn revoke_object_url(&self, url: &Url);
}

/// The global scope of a worker context.
pub trait WorkerScope: EventTarget {
    fn location(&self) -> &Url;

    /// Load and run scripts synchronously, in order.
    fn import_scripts(&self, urls: &[&str]) -> WorkerResult<()>;

    /// Send a message to the context that created this worker.
    fn post_message(&self, message: Value, transfer: TransferList) -> WorkerResult<()>;

    /// Stop this context. Messages already posted are still delivered.
    fn close(&self);

    fn global(&self, name: &str) -> Option<Value>;

    fn set_global(&self, name: &str, value: Value);

    /// Host for nested workers, if this runtime supports them.
    fn host(&self) -> Option<Arc<dyn WorkerHost>>;
}

/// A tracing runtime loaded into a worker by its bootstrap program.
pub trait TraceRuntime: Send + Sync {
    fn prepare(&self, ctx: &WorkerContext, options: &Value) -> WorkerResult<()>;

    fn start(&self, ctx: &WorkerContext) -> WorkerResult<()>;
}
