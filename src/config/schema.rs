//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.
//! Instrumentation fields also accept their camelCase names, the form used
//! by the options object a bootstrap program passes to the tracing runtime.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct TracerConfig {
    /// Worker instrumentation settings.
    pub instrumentation: InstrumentationConfig,

    /// Logging and metrics settings.
    pub observability: ObservabilityConfig,
}

/// Worker instrumentation settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct InstrumentationConfig {
    /// Whether instrumentation installs at all.
    pub enabled: bool,

    /// Whether workers created by an instrumented worker are instrumented too.
    #[serde(alias = "autoInjectIntoChildContexts")]
    pub auto_inject_into_child_contexts: bool,

    /// Location of the tracing runtime, relative to the base location.
    #[serde(alias = "tracingRuntimeUrl")]
    pub tracing_runtime_url: String,

    /// How long `ProxyWorker::snapshot` waits for a reply.
    #[serde(alias = "snapshotTimeoutMs")]
    pub snapshot_timeout_ms: u64,

    /// Records kept by each context's trace buffer.
    #[serde(alias = "traceBufferCapacity")]
    pub trace_buffer_capacity: usize,
}

impl InstrumentationConfig {
    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_inject_into_child_contexts: true,
            tracing_runtime_url: "tracer.js".to_string(),
            snapshot_timeout_ms: 5_000,
            trace_buffer_capacity: 4_096,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable, for development.
    #[default]
    Pretty,
    /// One JSON object per line, for machine parsing.
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log filter directive (trace, debug, info, warn, error, or a full
    /// `EnvFilter` directive). `RUST_LOG` takes precedence.
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
