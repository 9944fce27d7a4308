use std::collections::HashMap;

use anyhow::{bail, Error};

/// Entry of a [`WriteBackCache`].
#[derive(Clone, Debug)]
pub struct WriteBackEntry<V> {
    pub value: V,
    pub dirty: bool,
    /// Pinned entries must not be flushed or evicted; the chunk index pins
    /// an entry until the container holding its payload has committed.
    pub pinned: bool,
}

/// Batch of dirty entries handed to the flusher.
pub struct FlushBatch<V> {
    pub entries: Vec<(Vec<u8>, V)>,
}

/// Bounded dirty-entry cache in front of a persistent index.
///
/// Entries are byte-keyed. Dirty entries are flushed in batches; clean
/// unpinned entries are evicted on demand. Pinned entries are untouchable
/// either way.
pub struct WriteBackCache<V> {
    entries: HashMap<Vec<u8>, WriteBackEntry<V>>,
    capacity: usize,
    dirty_count: usize,
    pinned_count: usize,
}

impl<V: Clone> WriteBackCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            dirty_count: 0,
            pinned_count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty_count
    }

    pub fn pinned_count(&self) -> usize {
        self.pinned_count
    }

    pub fn dirty_ratio(&self) -> f64 {
        self.dirty_count as f64 / self.capacity as f64
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &[u8]) -> Option<&WriteBackEntry<V>> {
        self.entries.get(key)
    }

    pub fn value(&self, key: &[u8]) -> Option<&V> {
        self.entries.get(key).map(|entry| &entry.value)
    }

    pub fn is_pinned(&self, key: &[u8]) -> bool {
        self.entries.get(key).map(|e| e.pinned).unwrap_or(false)
    }

    /// Insert or replace an entry. Evicts a clean unpinned entry when at
    /// capacity; fails when every resident entry is dirty or pinned.
    pub fn insert(&mut self, key: &[u8], value: V, dirty: bool, pinned: bool) -> Result<(), Error> {
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.dirty != dirty {
                if dirty {
                    self.dirty_count += 1;
                } else {
                    self.dirty_count -= 1;
                }
            }
            if entry.pinned != pinned {
                if pinned {
                    self.pinned_count += 1;
                } else {
                    self.pinned_count -= 1;
                }
            }
            entry.value = value;
            entry.dirty = dirty;
            entry.pinned = pinned;
            return Ok(());
        }

        if self.entries.len() >= self.capacity {
            let victim = self
                .entries
                .iter()
                .find(|(_, e)| !e.dirty && !e.pinned)
                .map(|(k, _)| k.clone());
            match victim {
                Some(victim) => {
                    self.entries.remove(&victim);
                }
                None => bail!(
                    "write-back cache full ({} entries, {} dirty, {} pinned)",
                    self.entries.len(),
                    self.dirty_count,
                    self.pinned_count
                ),
            }
        }

        if dirty {
            self.dirty_count += 1;
        }
        if pinned {
            self.pinned_count += 1;
        }
        self.entries.insert(
            key.to_vec(),
            WriteBackEntry {
                value,
                dirty,
                pinned,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<V> {
        let entry = self.entries.remove(key)?;
        if entry.dirty {
            self.dirty_count -= 1;
        }
        if entry.pinned {
            self.pinned_count -= 1;
        }
        Some(entry.value)
    }

    /// Toggle the pin flag. Returns false when the key is not resident.
    pub fn set_pinned(&mut self, key: &[u8], pinned: bool) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                if entry.pinned != pinned {
                    if pinned {
                        self.pinned_count += 1;
                    } else {
                        self.pinned_count -= 1;
                    }
                    entry.pinned = pinned;
                }
                true
            }
            None => false,
        }
    }

    /// Collect up to `max` dirty unpinned entries for flushing. The entries
    /// stay dirty until [`Self::mark_clean`] confirms the flush.
    pub fn flush_candidates(&self, max: usize) -> FlushBatch<V> {
        let entries = self
            .entries
            .iter()
            .filter(|(_, e)| e.dirty && !e.pinned)
            .take(max)
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect();
        FlushBatch { entries }
    }

    pub fn mark_clean(&mut self, keys: &[Vec<u8>]) {
        for key in keys {
            if let Some(entry) = self.entries.get_mut(key) {
                if entry.dirty {
                    entry.dirty = false;
                    self.dirty_count -= 1;
                }
            }
        }
    }

    /// Keys of all pinned entries.
    pub fn pinned_keys(&self) -> Vec<Vec<u8>> {
        self.entries
            .iter()
            .filter(|(_, e)| e.pinned)
            .map(|(k, _)| k.clone())
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pinned_entries_survive_pressure() {
        let mut cache = WriteBackCache::new(2);
        cache.insert(b"a", 1u32, true, true).unwrap();
        cache.insert(b"b", 2u32, true, false).unwrap();
        // both resident entries are dirty, nothing can be evicted
        assert!(cache.insert(b"c", 3u32, true, false).is_err());

        cache.mark_clean(&[b"b".to_vec()]);
        cache.insert(b"c", 3u32, true, false).unwrap();
        assert!(cache.contains(b"a"));
        assert!(!cache.contains(b"b"));
        assert_eq!(cache.pinned_count(), 1);
    }

    #[test]
    fn flush_skips_pinned() {
        let mut cache = WriteBackCache::new(8);
        cache.insert(b"a", 1u32, true, true).unwrap();
        cache.insert(b"b", 2u32, true, false).unwrap();

        let batch = cache.flush_candidates(10);
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].0, b"b".to_vec());

        let keys: Vec<_> = batch.entries.iter().map(|(k, _)| k.clone()).collect();
        cache.mark_clean(&keys);
        assert_eq!(cache.dirty_count(), 1);

        // unpin and the entry becomes flushable
        assert!(cache.set_pinned(b"a", false));
        let batch = cache.flush_candidates(10);
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].0, b"a".to_vec());
    }
}
