//! Control channel shared by host and worker.
//!
//! # Data Flow
//! ```text
//! Host                                         Worker
//!   request_snapshot()
//!     → PendingRequests::register (Sent)
//!     → { isControl, "snapshot", {id} } ─────▶ control filter
//!                                                → TraceSink::snapshot()
//!   control filter ◀──── { isControl, "snapshot", {id, data} }
//!     → PendingRequests::resolve (Resolved)
//!
//!   control filter ◀──── { isControl, "close" }   scope.close()
//!     → registry removal, pending requests abandoned
//! ```
//!
//! Control messages share the channel with application messages. The flag
//! field decides which is which; a control message never reaches an
//! application listener.

pub mod message;
pub mod pending;

pub use message::{
    is_control, is_control_event, Command, ControlMessage, RequestId, SnapshotReply,
    SnapshotRequest, CONTROL_FLAG,
};
pub use pending::{PendingRequests, PendingSnapshot, SnapshotError};
