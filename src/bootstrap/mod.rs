//! Bootstrap program builder.
//!
//! # Data Flow
//! ```text
//! Instrumentation::create_worker
//!     → BootstrapProgram::build(id, base, runtime URL, application URL)
//!     → render() → object URL → native worker creation
//!
//! Inside the new worker (runtimes without a script engine):
//!     → BootstrapProgram::parse(source)
//!     → execute(ctx): globals, runtime import, prepare, start, application import
//! ```
//!
//! Statement order is fixed. The runtime must be imported before it is
//! prepared, prepared before it is started, and started before the
//! application script runs.

pub mod program;

pub use program::{BootstrapError, BootstrapParams, BootstrapProgram, Statement};

/// Global holding the worker ID assigned by the host.
pub const WORKER_ID_GLOBAL: &str = "TRACE_WORKER_ID";

/// Global holding the host's base location.
pub const BASE_URI_GLOBAL: &str = "TRACE_WORKER_BASE_URI";

/// Name the tracing runtime is reachable under inside the worker.
pub const RUNTIME_NAMESPACE: &str = "tracer";

/// Content type of the rendered program.
pub const CONTENT_TYPE: &str = "text/javascript";
