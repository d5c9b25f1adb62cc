//! Active-worker registry.
//!
//! Keeps every proxy handle reachable from the moment it is created until
//! the worker is terminated or reports that it closed, whether or not the
//! application still holds the handle. Removal is idempotent.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::host::proxy::ProxyWorker;
use crate::runtime::WorkerId;

#[derive(Default)]
pub struct Registry {
    entries: Mutex<Vec<ProxyWorker>>,
}

impl Registry {
    pub(crate) fn insert(&self, proxy: &ProxyWorker) {
        self.lock().push(proxy.clone());
    }

    /// Returns `false` if `id` was not registered.
    pub(crate) fn remove(&self, id: WorkerId) -> bool {
        let removed = {
            let mut entries = self.lock();
            entries
                .iter()
                .position(|proxy| proxy.id() == id)
                .map(|index| entries.remove(index))
        };
        // Dropped outside the lock: the last handle may own the native worker.
        removed.is_some()
    }

    /// Live handles in creation order.
    pub fn live(&self) -> Vec<ProxyWorker> {
        self.lock().clone()
    }

    pub fn contains(&self, id: WorkerId) -> bool {
        self.lock().iter().any(|proxy| proxy.id() == id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ProxyWorker>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
