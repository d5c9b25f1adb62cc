//! Worker-side instrumentation.
//!
//! # Data Flow
//! ```text
//! Bootstrap program
//!     → importScripts(tracing runtime) → WorkerTracer bound to the context
//!     → tracer.prepare({}) → InstrumentationConfig, TraceBuffer
//!     → tracer.start()
//!         → InstrumentedScope installed as the context's scope
//!         → Instrumentation installed as the context's host (nested workers)
//!     → importScripts(application script) → sees the instrumented scope
//!
//! Inbound messages
//!     → control filter (snapshot requests answered from the TraceBuffer)
//!     → relay (installed lazily per event type) → application listeners
//! ```

pub mod scope;
pub mod tracer;

pub use scope::InstrumentedScope;
pub use tracer::WorkerTracer;
