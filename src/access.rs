//! Set of identifiers accessed since the last flush.

use std::collections::BTreeSet;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct AccessStatCache {
    identifiers: Mutex<BTreeSet<String>>,
}

impl AccessStatCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time `identifier` is seen.
    pub fn add(&self, identifier: &str) -> bool {
        let mut set = self.identifiers.lock().unwrap_or_else(|p| p.into_inner());
        set.insert(identifier.to_string())
    }

    /// Sorted.
    pub fn all(&self) -> Vec<String> {
        let set = self.identifiers.lock().unwrap_or_else(|p| p.into_inner());
        set.iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.identifiers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }
}
