//! Named per-machine key-value storage.
//!
//! Storage belongs to the machine, not the process: contents survive
//! restarts and kills, and only a wipe from the control plane clears them.
//! Handles share the underlying map, so a wipe is visible through every
//! open handle immediately.

use std::{cell::RefCell, collections::BTreeMap, rc::Rc};

use crate::process::SimResource;

pub(crate) type StorageData = Rc<RefCell<BTreeMap<String, Vec<u8>>>>;

/// Handle to one named storage on one machine.
///
/// Opened through [`Environment::storage`](crate::Environment::storage);
/// tracked on the opening process and given back when it dies.
#[derive(Clone)]
pub struct StorageHandle {
    machine: String,
    name: String,
    data: StorageData,
}

impl StorageHandle {
    pub(crate) fn new(machine: &str, name: &str, data: StorageData) -> Self {
        Self {
            machine: machine.to_string(),
            name: name.to_lowercase(),
            data,
        }
    }

    /// Name of this storage.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stores a value under a key, replacing any previous value.
    pub fn put(&self, key: &str, value: impl Into<Vec<u8>>) {
        self.data.borrow_mut().insert(key.to_string(), value.into());
    }

    /// Reads a value.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.data.borrow().get(key).cloned()
    }

    /// Removes a key; true when it existed.
    pub fn remove(&self, key: &str) -> bool {
        self.data.borrow_mut().remove(key).is_some()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.data.borrow().len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.data.borrow().is_empty()
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        self.data.borrow().keys().cloned().collect()
    }
}

impl SimResource for StorageHandle {
    fn label(&self) -> String {
        format!("{}/{}", self.machine, self.name)
    }

    fn release(&self) {
        // Contents outlive the process; closing is just bookkeeping.
        tracing::trace!(storage = %self.label(), "closed");
    }
}
