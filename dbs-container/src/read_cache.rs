use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dbs_tools::lru_cache::LruCache;

use crate::container::Container;

/// LRU of deserialized containers, keyed by primary id.
///
/// Entries are handed out as `Arc` leases: eviction or invalidation only
/// drops the cache's reference, readers keep theirs until they drop it.
pub struct ContainerReadCache {
    state: Mutex<LruCache<u64, Arc<Container>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ContainerReadCache {
    pub fn new(lines: usize) -> Self {
        Self {
            state: Mutex::new(LruCache::new(lines)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, primary_id: u64) -> Option<Arc<Container>> {
        let mut state = self.state.lock().unwrap();
        match state.get_mut(primary_id) {
            Some(container) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(container.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, primary_id: u64, container: Arc<Container>) {
        self.state.lock().unwrap().insert(primary_id, container);
    }

    /// Drop an entry after a merge, move or delete changed its address.
    pub fn invalidate(&self, id: u64) {
        self.state.lock().unwrap().remove(id);
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().clear();
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
