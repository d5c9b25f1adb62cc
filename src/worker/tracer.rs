//! The tracing runtime loaded into each worker by its bootstrap program.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use url::Url;

use crate::bootstrap::{BASE_URI_GLOBAL, RUNTIME_NAMESPACE, WORKER_ID_GLOBAL};
use crate::config::InstrumentationConfig;
use crate::host::Instrumentation;
use crate::observability::{TraceBuffer, TraceSink};
use crate::runtime::{TraceRuntime, WorkerContext, WorkerError, WorkerId, WorkerResult};
use crate::worker::InstrumentedScope;

struct Prepared {
    config: InstrumentationConfig,
    buffer: Arc<TraceBuffer>,
}

/// Per-context tracing runtime.
///
/// `prepare` reads the options and creates the context's trace buffer;
/// `start` instruments the context's scope and, when enabled, the host used
/// for nested workers.
pub struct WorkerTracer {
    runtime_url: Url,
    defaults: InstrumentationConfig,
    prepared: Mutex<Option<Prepared>>,
}

impl WorkerTracer {
    /// `runtime_url` is where this runtime was loaded from. Nested workers
    /// load it from the same place.
    pub fn new(runtime_url: Url) -> Self {
        Self::with_defaults(runtime_url, InstrumentationConfig::default())
    }

    /// Use `defaults` when `prepare` receives an empty options object.
    pub fn with_defaults(runtime_url: Url, defaults: InstrumentationConfig) -> Self {
        Self {
            runtime_url,
            defaults,
            prepared: Mutex::new(None),
        }
    }

    /// Factory for [`LoopbackHost::register_runtime`](crate::runtime::loopback::LoopbackHost::register_runtime).
    pub fn factory(
        defaults: InstrumentationConfig,
    ) -> impl Fn(&Url) -> Arc<dyn TraceRuntime> + Send + Sync + 'static {
        move |url: &Url| -> Arc<dyn TraceRuntime> {
            Arc::new(WorkerTracer::with_defaults(url.clone(), defaults.clone()))
        }
    }

    pub fn runtime_url(&self) -> &Url {
        &self.runtime_url
    }

    /// The context's trace buffer, once prepared.
    pub fn buffer(&self) -> Option<Arc<TraceBuffer>> {
        self.lock().as_ref().map(|prepared| prepared.buffer.clone())
    }

    /// Effective configuration, once prepared.
    pub fn config(&self) -> Option<InstrumentationConfig> {
        self.lock().as_ref().map(|prepared| prepared.config.clone())
    }

    fn lock(&self) -> MutexGuard<'_, Option<Prepared>> {
        self.prepared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn options(&self, options: &Value) -> WorkerResult<InstrumentationConfig> {
        let empty = match options {
            Value::Null => true,
            Value::Object(fields) => fields.is_empty(),
            _ => false,
        };
        if empty {
            return Ok(self.defaults.clone());
        }
        serde_json::from_value(options.clone()).map_err(|err| {
            WorkerError::Bootstrap(format!("{RUNTIME_NAMESPACE}.prepare: invalid options: {err}"))
        })
    }
}

fn worker_id(ctx: &WorkerContext) -> WorkerResult<WorkerId> {
    ctx.native_scope()
        .global(WORKER_ID_GLOBAL)
        .and_then(|value| value.as_u64())
        .and_then(|raw| u32::try_from(raw).ok())
        .map(WorkerId)
        .ok_or_else(|| WorkerError::Bootstrap(format!("{WORKER_ID_GLOBAL} is not set")))
}

fn base_location(ctx: &WorkerContext) -> WorkerResult<Url> {
    let raw = ctx
        .native_scope()
        .global(BASE_URI_GLOBAL)
        .and_then(|value| value.as_str().map(str::to_string))
        .ok_or_else(|| WorkerError::Bootstrap(format!("{BASE_URI_GLOBAL} is not set")))?;
    Url::parse(&raw).map_err(|source| WorkerError::InvalidUrl { url: raw, source })
}

impl TraceRuntime for WorkerTracer {
    fn prepare(&self, _ctx: &WorkerContext, options: &Value) -> WorkerResult<()> {
        let config = self.options(options)?;
        let buffer = Arc::new(TraceBuffer::new(config.trace_buffer_capacity));
        *self.lock() = Some(Prepared { config, buffer });
        Ok(())
    }

    fn start(&self, ctx: &WorkerContext) -> WorkerResult<()> {
        let (config, buffer) = match self.lock().as_ref() {
            Some(prepared) => (prepared.config.clone(), prepared.buffer.clone()),
            None => {
                return Err(WorkerError::Bootstrap(format!(
                    "{RUNTIME_NAMESPACE}.start called before {RUNTIME_NAMESPACE}.prepare"
                )))
            }
        };
        if !config.enabled {
            tracing::debug!("Tracing runtime disabled by options");
            return Ok(());
        }

        let id = worker_id(ctx)?;
        let base = base_location(ctx)?;
        let sink: Arc<dyn TraceSink> = buffer;

        let scope = InstrumentedScope::install(ctx.native_scope(), id, base.clone(), sink.clone());
        ctx.bind_scope(scope);

        if config.auto_inject_into_child_contexts {
            if let Some(native_host) = ctx.native_scope().host() {
                let nested = Instrumentation::new(config, native_host, sink, base)?
                    .with_runtime_url(self.runtime_url.clone());
                ctx.bind_host(Arc::new(nested));
            }
        }

        tracing::debug!(worker_id = %id, "Tracing runtime started");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tracer() -> WorkerTracer {
        WorkerTracer::new(Url::parse("https://example.com/tracer.js").unwrap())
    }

    #[test]
    fn empty_options_use_defaults() {
        let tracer = tracer();
        assert_eq!(tracer.options(&json!({})).unwrap(), InstrumentationConfig::default());
        assert_eq!(tracer.options(&Value::Null).unwrap(), InstrumentationConfig::default());
    }

    #[test]
    fn explicit_options_override_defaults() {
        let tracer = tracer();
        let config = tracer
            .options(&json!({ "autoInjectIntoChildContexts": false, "traceBufferCapacity": 8 }))
            .unwrap();
        assert!(!config.auto_inject_into_child_contexts);
        assert_eq!(config.trace_buffer_capacity, 8);
    }

    #[test]
    fn invalid_options_fail_bootstrap() {
        let err = tracer().options(&json!({ "enabled": "yes" })).unwrap_err();
        assert!(matches!(err, WorkerError::Bootstrap(_)));
    }
}
