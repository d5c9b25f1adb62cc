//! Worker instrumentation and control channel.
//!
//! Wraps worker creation so that every worker's lifecycle and messaging is
//! recorded by a tracing system, without changing what application code
//! observes. A bootstrap program loads the tracing runtime into each new
//! worker ahead of the application script, and a tagged control protocol
//! carried on the ordinary message channel supports snapshot requests and
//! close notifications.

// Worker runtime surface
pub mod runtime;

// Instrumentation
pub mod bootstrap;
pub mod host;
pub mod protocol;
pub mod worker;

// Cross-cutting concerns
pub mod config;
pub mod observability;

pub use config::TracerConfig;
pub use host::{install, instrument, Instrumentation, ProxyWorker};
pub use observability::{TraceBuffer, TraceSink};
pub use protocol::{PendingSnapshot, SnapshotError};
pub use runtime::{WorkerContext, WorkerError, WorkerHost, WorkerId};
pub use worker::{InstrumentedScope, WorkerTracer};
