//! The per-worker injection seam.
//!
//! Scripts running inside a worker never reach for ambient globals. They ask
//! the [`WorkerContext`] for the scope and the worker host to use, and the
//! tracing runtime rebinds both when it starts.

use std::sync::{Arc, PoisonError, RwLock};

use crate::runtime::{TraceRuntime, WorkerHost, WorkerScope};

pub struct WorkerContext {
    native: Arc<dyn WorkerScope>,
    scope: RwLock<Arc<dyn WorkerScope>>,
    host: RwLock<Option<Arc<dyn WorkerHost>>>,
    runtime: RwLock<Option<Arc<dyn TraceRuntime>>>,
}

impl WorkerContext {
    /// Create a context whose bindings all point at the native scope.
    pub fn new(native: Arc<dyn WorkerScope>) -> Self {
        let host = native.host();
        Self {
            scope: RwLock::new(native.clone()),
            native,
            host: RwLock::new(host),
            runtime: RwLock::new(None),
        }
    }

    /// The scope provided by the native runtime, never rebound.
    pub fn native_scope(&self) -> Arc<dyn WorkerScope> {
        self.native.clone()
    }

    /// The scope application scripts should use.
    pub fn scope(&self) -> Arc<dyn WorkerScope> {
        self.scope.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn bind_scope(&self, scope: Arc<dyn WorkerScope>) {
        *self.scope.write().unwrap_or_else(PoisonError::into_inner) = scope;
    }

    /// The host to create nested workers with, if the runtime supports them.
    pub fn host(&self) -> Option<Arc<dyn WorkerHost>> {
        self.host.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn bind_host(&self, host: Arc<dyn WorkerHost>) {
        *self.host.write().unwrap_or_else(PoisonError::into_inner) = Some(host);
    }

    /// The tracing runtime loaded into this context, if any.
    pub fn runtime(&self) -> Option<Arc<dyn TraceRuntime>> {
        self.runtime.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn bind_runtime(&self, runtime: Arc<dyn TraceRuntime>) {
        *self.runtime.write().unwrap_or_else(PoisonError::into_inner) = Some(runtime);
    }
}
