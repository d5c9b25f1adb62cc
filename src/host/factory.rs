//! Host-side proxy factory.
//!
//! [`Instrumentation`] is the replacement worker creation entry point. It
//! owns the id counter, the pending snapshot requests and the registry, so
//! two instances never share any of them.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::{json, Value};
use url::Url;

use crate::bootstrap::{BootstrapParams, BootstrapProgram, CONTENT_TYPE};
use crate::config::InstrumentationConfig;
use crate::host::{HostShared, ProxyWorker, Registry};
use crate::observability::metrics;
use crate::observability::{Scope, TraceSink};
use crate::protocol::{PendingRequests, PendingSnapshot, SnapshotError};
use crate::runtime::{
    resolve_script_url, NativeWorker, WorkerHost, WorkerId, WorkerOptions, WorkerResult,
};

#[derive(Clone)]
pub struct Instrumentation {
    native: Arc<dyn WorkerHost>,
    shared: Arc<HostShared>,
    base: Url,
    runtime_url: Url,
}

impl Instrumentation {
    /// Wrap `native`. Script URLs and the tracing runtime URL from `config`
    /// are resolved against `base`.
    pub fn new(
        config: InstrumentationConfig,
        native: Arc<dyn WorkerHost>,
        sink: Arc<dyn TraceSink>,
        base: Url,
    ) -> WorkerResult<Self> {
        let runtime_url = resolve_script_url(&base, &config.tracing_runtime_url)?;
        let shared = Arc::new(HostShared {
            config,
            sink,
            registry: Registry::default(),
            pending: Arc::new(PendingRequests::new()),
            next_id: AtomicU32::new(0),
        });
        Ok(Self {
            native,
            shared,
            base,
            runtime_url,
        })
    }

    /// Load the tracing runtime from `url` instead of the configured one.
    pub fn with_runtime_url(mut self, url: Url) -> Self {
        self.runtime_url = url;
        self
    }

    pub fn base_location(&self) -> &Url {
        &self.base
    }

    pub fn tracing_runtime_url(&self) -> &Url {
        &self.runtime_url
    }

    pub fn config(&self) -> &InstrumentationConfig {
        &self.shared.config
    }

    /// Create an instrumented worker running `script_url`.
    ///
    /// Errors from the native host are returned unchanged.
    pub fn create_worker(
        &self,
        script_url: &str,
        options: &WorkerOptions,
    ) -> WorkerResult<ProxyWorker> {
        let id = WorkerId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let resolved = resolve_script_url(&self.base, script_url)?;

        let program = BootstrapProgram::build(&BootstrapParams {
            worker_id: id,
            base_location: &self.base,
            tracing_runtime_url: &self.runtime_url,
            application_script_url: &resolved,
        });
        let object_url = self.native.create_object_url(program.render(), CONTENT_TYPE)?;

        let native = {
            let _scope = Scope::enter(
                self.shared.sink.as_ref(),
                "worker.create",
                vec![("url", json!(script_url)), ("id", json!(id.as_u32()))],
            );
            let created = self.native.create_worker(object_url.as_str(), options);
            self.native.revoke_object_url(&object_url);
            created.inspect_err(|err| {
                tracing::debug!(worker_id = %id, script_url, error = %err, "Native worker creation failed");
            })?
        };

        let proxy = ProxyWorker::attach(
            id,
            script_url.to_string(),
            resolved,
            native,
            Arc::clone(&self.shared),
        );
        self.shared.registry.insert(&proxy);
        metrics::record_worker_created();
        tracing::debug!(
            worker_id = %id,
            script_url,
            resolved_url = %proxy.resolved_script_url(),
            "Worker created"
        );
        Ok(proxy)
    }

    /// Live handles, in creation order.
    pub fn workers(&self) -> Vec<ProxyWorker> {
        self.shared.registry.live()
    }

    pub fn worker_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Snapshot requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    /// Send a snapshot request to every live worker.
    pub fn snapshot_all(&self) -> Vec<(WorkerId, Result<PendingSnapshot, SnapshotError>)> {
        self.workers()
            .into_iter()
            .map(|worker| (worker.id(), worker.request_snapshot()))
            .collect()
    }

    /// Snapshot every live worker and wait for all replies, each bounded by
    /// the configured timeout.
    pub async fn collect_snapshots(&self) -> Vec<(WorkerId, Result<Value, SnapshotError>)> {
        let timeout = self.shared.config.snapshot_timeout();
        let requests = self.snapshot_all().into_iter().map(|(id, request)| async move {
            let result = match request {
                Ok(pending) => pending.timeout(timeout).await,
                Err(err) => Err(err),
            };
            (id, result)
        });
        join_all(requests).await
    }

    /// Terminate every live worker. Returns how many were terminated, or the
    /// first native error after attempting all of them.
    pub fn shutdown(&self) -> WorkerResult<usize> {
        let workers = self.workers();
        let count = workers.len();
        let mut first_error = None;
        for worker in workers {
            if let Err(err) = worker.terminate() {
                tracing::warn!(worker_id = %worker.id(), error = %err, "Failed to terminate worker");
                first_error.get_or_insert(err);
            }
        }
        tracing::info!(workers = count, "Instrumentation shut down");
        match first_error {
            Some(err) => Err(err),
            None => Ok(count),
        }
    }
}

impl WorkerHost for Instrumentation {
    fn location(&self) -> &Url {
        &self.base
    }

    fn create_worker(
        &self,
        script_url: &str,
        options: &WorkerOptions,
    ) -> WorkerResult<Box<dyn NativeWorker>> {
        let proxy = Instrumentation::create_worker(self, script_url, options)?;
        Ok(Box::new(proxy))
    }

    fn create_object_url(&self, source: String, content_type: &str) -> WorkerResult<Url> {
        self.native.create_object_url(source, content_type)
    }

    fn revoke_object_url(&self, url: &Url) {
        self.native.revoke_object_url(url);
    }
}
