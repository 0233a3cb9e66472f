//! Per-key permit registry: lazily created, reference-counted by pending
//! item count, torn down at zero so memory tracks active keys rather than
//! every key ever seen.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;

use crate::metrics;
use crate::types::ProjectKey;

/// One key's serialization state: a single-permit semaphore plus the number
/// of items still checked in against it.
pub(crate) struct KeyEntry {
    /// Capacity-1 permit; holding it spans one item's entire action
    pub serial: Arc<Semaphore>,
    pending: AtomicUsize,
}

impl Default for KeyEntry {
    fn default() -> Self {
        Self {
            serial: Arc::new(Semaphore::new(1)),
            pending: AtomicUsize::new(0),
        }
    }
}

/// Concurrent map of live key entries plus the set of keys whose item is
/// executing right now.
pub(crate) struct KeyRegistry {
    entries: DashMap<ProjectKey, Arc<KeyEntry>>,
    executing: DashMap<ProjectKey, ()>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            executing: DashMap::new(),
        }
    }

    /// Register `n` pending items against `key`, creating the entry on
    /// first use. The pending increment happens under the map guard so a
    /// concurrent teardown can never hand out an orphaned semaphore.
    pub fn checkin(&self, key: &ProjectKey, n: usize) -> Arc<KeyEntry> {
        let guard = self.entries.entry(key.clone()).or_default();
        guard.pending.fetch_add(n, Ordering::SeqCst);
        guard.value().clone()
    }

    /// Unregister `n` items; removes the entry once nothing is pending.
    pub fn checkout(&self, key: &ProjectKey, n: usize) {
        let emptied = match self.entries.get(key) {
            Some(entry) => entry.pending.fetch_sub(n, Ordering::SeqCst) == n,
            None => false,
        };
        if emptied {
            // Re-checked under the write lock: a checkin racing in between
            // keeps the entry alive.
            self.entries
                .remove_if(key, |_, entry| entry.pending.load(Ordering::SeqCst) == 0);
        }
    }

    pub fn mark_executing(&self, key: &ProjectKey) {
        self.executing.insert(key.clone(), ());
        metrics::set_executing_keys(self.executing.len() as i64);
    }

    pub fn clear_executing(&self, key: &ProjectKey) {
        self.executing.remove(key);
        metrics::set_executing_keys(self.executing.len() as i64);
    }

    pub fn executing_keys(&self) -> Vec<ProjectKey> {
        self.executing.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_executing(&self, key: &ProjectKey) -> bool {
        self.executing.contains_key(key)
    }

    pub fn active_key_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_torn_down_at_zero_pending() {
        let registry = KeyRegistry::new();
        let key: ProjectKey = "p1".into();

        let entry = registry.checkin(&key, 2);
        assert_eq!(registry.active_key_count(), 1);

        registry.checkout(&key, 1);
        assert_eq!(registry.active_key_count(), 1);
        registry.checkout(&key, 1);
        assert_eq!(registry.active_key_count(), 0);

        // The old handle stays valid for its holder even after teardown.
        assert_eq!(entry.serial.available_permits(), 1);
    }

    #[test]
    fn test_checkin_during_teardown_keeps_entry() {
        let registry = KeyRegistry::new();
        let key: ProjectKey = "p1".into();

        let first = registry.checkin(&key, 1);
        let second = registry.checkin(&key, 1);
        registry.checkout(&key, 1);
        assert_eq!(registry.active_key_count(), 1);
        // Both handles refer to the same semaphore.
        assert!(Arc::ptr_eq(&first.serial, &second.serial));
    }
}
