//! Per-watch in-flight flag. A watch is never checked concurrently with itself.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use herald_common::types::WatchKey;

#[derive(Clone, Default)]
pub struct InFlight {
    keys: Arc<Mutex<HashSet<WatchKey>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` for the lifetime of the returned guard, or `None` if a
    /// check already holds it.
    pub fn try_claim(&self, key: &WatchKey) -> Option<InFlightGuard> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if !keys.insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            keys: Arc::clone(&self.keys),
            key: key.clone(),
        })
    }

    pub fn contains(&self, key: &WatchKey) -> bool {
        let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases the claim on drop.
pub struct InFlightGuard {
    keys: Arc<Mutex<HashSet<WatchKey>>>,
    key: WatchKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.remove(&self.key);
    }
}
