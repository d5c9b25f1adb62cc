//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Proxy handles, factory, instrumented scopes produce:
//!     → trace.rs   (scope and instant records, buffered per context)
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters)
//!
//! Consumers:
//!     → snapshot requests (trace.rs buffer, serialized to JSON)
//!     → stdout (pretty or JSON logs)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Trace records are mirrored to `tracing` at TRACE level
//! - Metrics are cheap (atomic increments) and recorded even without an
//!   exporter installed

pub mod logging;
pub mod metrics;
pub mod trace;

pub use trace::{RecordKind, Scope, ScopeId, TraceArgs, TraceBuffer, TraceRecord, TraceSink};
