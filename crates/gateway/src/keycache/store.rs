//! Keyed container of cache entries, and the iteration capability consumed
//! by the prefetcher.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::entry::KeyEntry;

/// Snapshot iteration over cache entries. The prefetcher depends only on
/// this trait so tests can feed it fixed entry sets.
pub trait EntryIterator: Send + Sync {
    /// A point-in-time snapshot of all entries.
    fn snapshot(&self) -> Vec<Arc<KeyEntry>>;
}

/// In-memory map of key id → entry.
#[derive(Default)]
pub struct KeyStore {
    entries: RwLock<HashMap<String, Arc<KeyEntry>>>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for its key id.
    pub fn insert(&self, entry: Arc<KeyEntry>) {
        self.entries
            .write()
            .insert(entry.key_id().to_owned(), entry);
    }

    pub fn get(&self, key_id: &str) -> Option<Arc<KeyEntry>> {
        self.entries.read().get(key_id).cloned()
    }

    pub fn remove(&self, key_id: &str) -> Option<Arc<KeyEntry>> {
        self.entries.write().remove(key_id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl EntryIterator for KeyStore {
    fn snapshot(&self) -> Vec<Arc<KeyEntry>> {
        self.entries.read().values().cloned().collect()
    }
}
