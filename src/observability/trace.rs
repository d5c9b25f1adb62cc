//! Trace event emission.
//!
//! Instrumented operations record *scopes* (an enter and a leave bracketing
//! a call) and *instants* (a single point in time) into a [`TraceSink`].
//! [`Scope`] is the guard that guarantees the leave: it is recorded when the
//! guard drops, on every exit path.
//!
//! [`TraceBuffer`] is the sink used by both contexts. It keeps the most
//! recent records in a bounded ring and answers snapshot requests with them.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;
use serde_json::{Map, Value};

/// Named arguments attached to a record.
pub type TraceArgs = Vec<(&'static str, Value)>;

/// Identifies one entered scope within a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ScopeId(pub u64);

/// Destination of trace records.
pub trait TraceSink: Send + Sync {
    fn enter_scope(&self, name: &'static str, args: TraceArgs) -> ScopeId;

    /// Attach more data to a scope that is still open.
    fn append_scope_data(&self, scope: ScopeId, args: TraceArgs);

    fn leave_scope(&self, scope: ScopeId);

    fn instant(&self, name: &'static str, args: TraceArgs);

    /// Serialized view of the current trace state.
    fn snapshot(&self) -> Value;
}

/// An open scope, left when dropped.
#[must_use = "the scope is left as soon as the guard is dropped"]
pub struct Scope<'a> {
    sink: &'a dyn TraceSink,
    id: ScopeId,
}

impl<'a> Scope<'a> {
    pub fn enter(sink: &'a dyn TraceSink, name: &'static str, args: TraceArgs) -> Self {
        let id = sink.enter_scope(name, args);
        Self { sink, id }
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn append(&self, args: TraceArgs) {
        self.sink.append_scope_data(self.id, args);
    }
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        self.sink.leave_scope(self.id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Enter,
    Append,
    Leave,
    Instant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceRecord {
    pub kind: RecordKind,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeId>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub args: Map<String, Value>,
    /// Microseconds since the buffer was created.
    pub timestamp_us: u64,
}

impl TraceRecord {
    /// Value of a named argument.
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.get(name)
    }
}

#[derive(Default)]
struct BufferState {
    records: VecDeque<TraceRecord>,
    open: HashMap<ScopeId, &'static str>,
    dropped: u64,
}

/// Bounded in-memory trace sink.
///
/// When full, the oldest record is discarded and counted in
/// [`dropped`](Self::dropped).
pub struct TraceBuffer {
    capacity: usize,
    started: Instant,
    next_scope: AtomicU64,
    state: Mutex<BufferState>,
}

impl TraceBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            started: Instant::now(),
            next_scope: AtomicU64::new(0),
            state: Mutex::new(BufferState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Buffered records, oldest first.
    pub fn records(&self) -> Vec<TraceRecord> {
        self.lock().records.iter().cloned().collect()
    }

    /// Buffered records with the given name, oldest first.
    pub fn records_named(&self, name: &str) -> Vec<TraceRecord> {
        self.lock()
            .records
            .iter()
            .filter(|record| record.name == name)
            .cloned()
            .collect()
    }

    /// Scopes entered and not yet left.
    pub fn open_scopes(&self) -> usize {
        self.lock().open.len()
    }

    /// Records discarded because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn elapsed_us(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    fn push(&self, state: &mut BufferState, record: TraceRecord) {
        let args = Value::Object(record.args.clone());
        tracing::trace!(
            kind = ?record.kind,
            name = %record.name,
            scope = ?record.scope,
            args = %args,
            "trace record"
        );
        if state.records.len() == self.capacity {
            state.records.pop_front();
            state.dropped += 1;
        }
        state.records.push_back(record);
    }
}

fn to_map(args: TraceArgs) -> Map<String, Value> {
    args.into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

impl TraceSink for TraceBuffer {
    fn enter_scope(&self, name: &'static str, args: TraceArgs) -> ScopeId {
        let id = ScopeId(self.next_scope.fetch_add(1, Ordering::Relaxed));
        let record = TraceRecord {
            kind: RecordKind::Enter,
            name: name.to_string(),
            scope: Some(id),
            args: to_map(args),
            timestamp_us: self.elapsed_us(),
        };
        let mut state = self.lock();
        state.open.insert(id, name);
        self.push(&mut state, record);
        id
    }

    fn append_scope_data(&self, scope: ScopeId, args: TraceArgs) {
        let mut state = self.lock();
        let Some(name) = state.open.get(&scope).copied() else {
            return;
        };
        let record = TraceRecord {
            kind: RecordKind::Append,
            name: name.to_string(),
            scope: Some(scope),
            args: to_map(args),
            timestamp_us: self.elapsed_us(),
        };
        self.push(&mut state, record);
    }

    fn leave_scope(&self, scope: ScopeId) {
        let mut state = self.lock();
        let Some(name) = state.open.remove(&scope) else {
            return;
        };
        let record = TraceRecord {
            kind: RecordKind::Leave,
            name: name.to_string(),
            scope: Some(scope),
            args: Map::new(),
            timestamp_us: self.elapsed_us(),
        };
        self.push(&mut state, record);
    }

    fn instant(&self, name: &'static str, args: TraceArgs) {
        let record = TraceRecord {
            kind: RecordKind::Instant,
            name: name.to_string(),
            scope: None,
            args: to_map(args),
            timestamp_us: self.elapsed_us(),
        };
        let mut state = self.lock();
        self.push(&mut state, record);
    }

    fn snapshot(&self) -> Value {
        let records = self.records();
        serde_json::to_value(&records).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "Failed to serialize trace snapshot");
            Value::Array(Vec::new())
        })
    }
}
