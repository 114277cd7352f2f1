//! Auxiliary address registry: channel name -> every auxiliary pair registered under it.
//! Entries are never consumed or evicted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::protocol::AddrPair;

#[derive(Clone, Default)]
pub struct AuxRegistry {
    entries: Arc<Mutex<HashMap<String, Vec<AddrPair>>>>,
}

impl AuxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<AddrPair>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `pair` to the list for `name`.
    pub fn register(&self, name: &str, pair: AddrPair) {
        self.lock().entry(name.to_string()).or_default().push(pair);
    }

    /// Snapshot of the pairs registered under `name`, in registration order.
    pub fn list(&self, name: &str) -> Vec<AddrPair> {
        self.lock().get(name).cloned().unwrap_or_default()
    }
}
