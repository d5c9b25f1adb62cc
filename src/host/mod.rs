//! Host-side instrumentation.
//!
//! # Data Flow
//! ```text
//! Application
//!     → install() → Arc<dyn WorkerHost> (Instrumentation, or the native host when disabled)
//!       (instrument() returns the Instrumentation itself, for callers that broadcast)
//!     → Instrumentation::create_worker(url)
//!         → allocate WorkerId, resolve url against the base location
//!         → BootstrapProgram → object URL → native create_worker (traced)
//!         → ProxyWorker (control filter installed first) → Registry
//!     → ProxyWorker::post_message / terminate (traced, forwarded 1:1)
//!
//! Native handle events
//!     → control filter (snapshot replies, close notifications; consumed)
//!     → relay (installed lazily per event type) → application listeners
//! ```
//!
//! # Responsibilities
//! - Own the per-host state: id counter, pending requests, registry
//! - Keep control traffic away from application listeners

pub mod factory;
pub mod proxy;
pub mod registry;

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use url::Url;

use crate::config::InstrumentationConfig;
use crate::observability::TraceSink;
use crate::protocol::PendingRequests;
use crate::runtime::{WorkerHost, WorkerResult};

pub use factory::Instrumentation;
pub use proxy::ProxyWorker;
pub use registry::Registry;

/// State shared by an [`Instrumentation`] and every handle it created.
pub(crate) struct HostShared {
    pub(crate) config: InstrumentationConfig,
    pub(crate) sink: Arc<dyn TraceSink>,
    pub(crate) registry: Registry,
    pub(crate) pending: Arc<PendingRequests>,
    pub(crate) next_id: AtomicU32,
}

/// Build the instrumentation for `native`, or `None` when instrumentation
/// is disabled.
pub fn instrument(
    config: &InstrumentationConfig,
    native: Arc<dyn WorkerHost>,
    sink: Arc<dyn TraceSink>,
    base: Url,
) -> WorkerResult<Option<Instrumentation>> {
    if !config.enabled {
        tracing::info!("Worker instrumentation disabled");
        return Ok(None);
    }

    let instrumentation = Instrumentation::new(config.clone(), native, sink, base)?;
    tracing::info!(
        base = %instrumentation.base_location(),
        tracing_runtime = %instrumentation.tracing_runtime_url(),
        auto_inject = config.auto_inject_into_child_contexts,
        "Worker instrumentation installed"
    );
    Ok(Some(instrumentation))
}

/// Wrap `native` so every worker it creates is instrumented.
///
/// Returns `native` itself when instrumentation is disabled.
pub fn install(
    config: &InstrumentationConfig,
    native: Arc<dyn WorkerHost>,
    sink: Arc<dyn TraceSink>,
    base: Url,
) -> WorkerResult<Arc<dyn WorkerHost>> {
    match instrument(config, native.clone(), sink, base)? {
        Some(instrumentation) => Ok(Arc::new(instrumentation)),
        None => Ok(native),
    }
}
