//! Control message envelope and payloads.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

use crate::runtime::WorkerEvent;

/// Field marking a message as control traffic.
pub const CONTROL_FLAG: &str = "isControl";

/// Correlates a snapshot reply with its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Snapshot,
    Close,
    /// Any command this version does not know. Ignored on receipt.
    #[serde(other)]
    Unknown,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Snapshot => "snapshot",
            Command::Close => "close",
            Command::Unknown => "unknown",
        }
    }
}

/// `snapshot` request payload (host to worker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub id: RequestId,
}

/// `snapshot` reply payload (worker to host).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotReply {
    pub id: RequestId,
    #[serde(default)]
    pub data: Value,
}

/// A decoded control envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub command: Command,
    /// Command payload, `Null` when absent.
    pub value: Value,
}

impl ControlMessage {
    pub fn new(command: Command, value: Value) -> Self {
        Self { command, value }
    }

    pub fn snapshot_request(id: RequestId) -> Self {
        Self::new(Command::Snapshot, json!(SnapshotRequest { id }))
    }

    pub fn snapshot_reply(id: RequestId, data: Value) -> Self {
        Self::new(Command::Snapshot, json!(SnapshotReply { id, data }))
    }

    pub fn close() -> Self {
        Self::new(Command::Close, Value::Null)
    }

    /// Wire form carried as an ordinary message payload.
    pub fn to_value(&self) -> Value {
        let mut fields = Map::new();
        fields.insert(CONTROL_FLAG.to_string(), Value::Bool(true));
        fields.insert("command".to_string(), Value::from(self.command.as_str()));
        fields.insert("value".to_string(), self.value.clone());
        Value::Object(fields)
    }

    /// Decode `data` if it carries a truthy control flag.
    ///
    /// Flagged messages with a missing or unrecognized command decode to
    /// [`Command::Unknown`]; they are still control traffic.
    pub fn sniff(data: &Value) -> Option<Self> {
        let fields = data.as_object()?;
        if !fields.get(CONTROL_FLAG).is_some_and(is_truthy) {
            return None;
        }

        let command = fields
            .get("command")
            .and_then(|c| Command::deserialize(c).ok())
            .unwrap_or(Command::Unknown);
        let value = fields.get("value").cloned().unwrap_or(Value::Null);
        Some(Self { command, value })
    }

    /// Decode the payload into a typed command value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.value)
    }
}

/// Whether a message payload is control traffic.
pub fn is_control(data: &Value) -> bool {
    data.as_object()
        .and_then(|fields| fields.get(CONTROL_FLAG))
        .is_some_and(is_truthy)
}

/// Whether an event is a message carrying control traffic.
pub fn is_control_event(event: &WorkerEvent) -> bool {
    event.message_data().is_some_and(is_control)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_form() {
        let message = ControlMessage::snapshot_request(RequestId(4));
        assert_eq!(
            message.to_value(),
            json!({ "isControl": true, "command": "snapshot", "value": { "id": 4 } })
        );
        assert_eq!(
            ControlMessage::close().to_value(),
            json!({ "isControl": true, "command": "close", "value": null })
        );
    }

    #[test]
    fn flag_must_be_truthy() {
        assert!(is_control(&json!({ "isControl": 1, "command": "close" })));
        assert!(is_control(&json!({ "isControl": "yes" })));
        assert!(!is_control(&json!({ "isControl": false, "command": "close" })));
        assert!(!is_control(&json!({ "isControl": 0 })));
        assert!(!is_control(&json!({ "isControl": "" })));
        assert!(!is_control(&json!({ "command": "close" })));
        assert!(!is_control(&json!(["isControl"])));
        assert!(!is_control(&json!("isControl")));
    }

    #[test]
    fn unknown_commands_are_still_control() {
        let sniffed = ControlMessage::sniff(&json!({ "isControl": true, "command": "reload" })).unwrap();
        assert_eq!(sniffed.command, Command::Unknown);
        assert_eq!(sniffed.value, Value::Null);

        let sniffed = ControlMessage::sniff(&json!({ "isControl": true })).unwrap();
        assert_eq!(sniffed.command, Command::Unknown);
    }

    #[test]
    fn decodes_snapshot_reply() {
        let sniffed = ControlMessage::sniff(&json!({
            "isControl": true,
            "command": "snapshot",
            "value": { "id": 0, "data": ["X"] }
        }))
        .unwrap();
        assert_eq!(sniffed.command, Command::Snapshot);

        let reply: SnapshotReply = sniffed.decode().unwrap();
        assert_eq!(reply.id, RequestId(0));
        assert_eq!(reply.data, json!(["X"]));
    }
}
