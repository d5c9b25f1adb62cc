//! Listener bookkeeping shared by every event target in the crate.
//!
//! # Responsibilities
//! - Register and unregister listeners per event type
//! - Report the first registration and the last removal for a type, so
//!   wrappers can subscribe to the wrapped target lazily
//! - Dispatch an event to a snapshot of the listeners (a listener may add or
//!   remove listeners while it runs)

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::runtime::types::{EventType, Listener, ListenerId, WorkerEvent};

/// Per-type listener lists.
#[derive(Default)]
pub struct EventListeners {
    next_id: AtomicU64,
    slots: Mutex<HashMap<EventType, Vec<(ListenerId, Listener)>>>,
}

impl EventListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener.
    ///
    /// Returns the listener ID and whether it is the first listener for
    /// `event_type`.
    pub fn add(&self, event_type: EventType, listener: Listener) -> (ListenerId, bool) {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let entries = slots.entry(event_type).or_default();
        entries.push((id, listener));
        (id, entries.len() == 1)
    }

    /// Unregister a listener.
    ///
    /// Returns `None` if the listener was not registered, otherwise whether
    /// it was the last listener for `event_type`.
    pub fn remove(&self, event_type: EventType, id: ListenerId) -> Option<bool> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let entries = slots.get_mut(&event_type)?;
        let index = entries.iter().position(|(existing, _)| *existing == id)?;
        entries.remove(index);
        if entries.is_empty() {
            slots.remove(&event_type);
            Some(true)
        } else {
            Some(false)
        }
    }

    /// Invoke every listener registered for the event's type.
    /// Returns the number of listeners invoked.
    pub fn dispatch(&self, event: &WorkerEvent) -> usize {
        let listeners: Vec<Listener> = {
            let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            match slots.get(&event.event_type()) {
                Some(entries) => entries.iter().map(|(_, l)| l.clone()).collect(),
                None => return 0,
            }
        };
        for listener in &listeners {
            listener(event);
        }
        listeners.len()
    }

    /// Number of listeners registered for `event_type`.
    pub fn count(&self, event_type: EventType) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(&event_type).map_or(0, Vec::len)
    }
}
