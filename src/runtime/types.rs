//! Worker identifiers, events and errors shared by both sides of a channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Identifier assigned to an instrumented worker by the host that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u32);

impl WorkerId {
    /// Get the raw ID value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Buffers whose ownership moves to the receiving side of a message.
pub type TransferList = Vec<Vec<u8>>;

/// Event types a worker handle or a worker global scope can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Message,
    Error,
    Online,
    Offline,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Message => "message",
            EventType::Error => "error",
            EventType::Online => "online",
            EventType::Offline => "offline",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message delivered over a worker channel.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub data: Value,
    pub transfer: TransferList,
}

impl MessageEvent {
    pub fn new(data: Value, transfer: TransferList) -> Self {
        Self { data, transfer }
    }
}

/// An uncaught failure inside a worker, reported to its creator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorEvent {
    pub message: String,
    pub filename: String,
    pub lineno: u32,
    pub colno: u32,
}

/// Everything a listener can observe.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Message(MessageEvent),
    Error(ErrorEvent),
    Online,
    Offline,
}

impl WorkerEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            WorkerEvent::Message(_) => EventType::Message,
            WorkerEvent::Error(_) => EventType::Error,
            WorkerEvent::Online => EventType::Online,
            WorkerEvent::Offline => EventType::Offline,
        }
    }

    /// Payload of a message event, `None` for every other event.
    pub fn message_data(&self) -> Option<&Value> {
        match self {
            WorkerEvent::Message(message) => Some(&message.data),
            _ => None,
        }
    }
}

/// Callback registered for one event type.
pub type Listener = Arc<dyn Fn(&WorkerEvent) + Send + Sync>;

/// Token returned when a listener is registered; used to unregister it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// Errors raised by native worker operations and by the worker runtime.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// A script URL could not be resolved to an absolute URL.
    #[error("invalid script URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// No script is served at the given URL.
    #[error("script not found: {0}")]
    ScriptNotFound(String),

    /// The native runtime refused to create a worker.
    #[error("failed to create worker for '{url}': {reason}")]
    Spawn { url: String, reason: String },

    /// The native runtime refused to deliver a message.
    #[error("failed to post message: {0}")]
    PostMessage(String),

    /// The native runtime failed to terminate a worker.
    #[error("failed to terminate worker: {0}")]
    Terminate(String),

    /// A script raised an error while it ran.
    #[error("script '{url}' failed: {reason}")]
    Script { url: String, reason: String },

    /// The bootstrap program could not run to completion.
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    /// The worker context has already shut down.
    #[error("worker context is closed")]
    Closed,
}

pub type WorkerResult<T> = Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn worker_id_display() {
        assert_eq!(WorkerId(7).to_string(), "worker-7");
    }

    #[test]
    fn event_type_of_events() {
        let message = WorkerEvent::Message(MessageEvent::new(json!("hi"), Vec::new()));
        assert_eq!(message.event_type(), EventType::Message);
        assert_eq!(message.message_data(), Some(&json!("hi")));

        let error = WorkerEvent::Error(ErrorEvent::default());
        assert_eq!(error.event_type(), EventType::Error);
        assert!(error.message_data().is_none());
    }
}
