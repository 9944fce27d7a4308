//! Least recently used (LRU) cache
//!
//! A HashMap gives fast access by key, a slab of index-linked nodes keeps
//! the access order. Using slab indices instead of pointers keeps the whole
//! structure safe code.

use std::collections::HashMap;

const NIL: usize = usize::MAX;

struct CacheNode<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
}

/// LRU cache instance, evicting the least recently used entry once
/// `capacity` is exceeded.
pub struct LruCache<K, V> {
    map: HashMap<K, usize>,
    nodes: Vec<Option<CacheNode<K, V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    capacity: usize,
}

impl<K: std::cmp::Eq + std::hash::Hash + Copy, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            map: HashMap::with_capacity(capacity),
            nodes: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.nodes.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    /// Insert or update `key`, making it the most recently used entry.
    /// Returns the evicted entry, if the capacity was exceeded.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(&slot) = self.map.get(&key) {
            self.node_mut(slot).value = value;
            self.unlink(slot);
            self.push_front(slot);
            return None;
        }

        let node = CacheNode {
            key,
            value,
            prev: NIL,
            next: NIL,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.map.insert(key, slot);
        self.push_front(slot);

        if self.map.len() > self.capacity {
            return self.pop_tail();
        }
        None
    }

    /// Get a mutable reference and mark the entry as most recently used.
    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        let slot = *self.map.get(&key)?;
        self.unlink(slot);
        self.push_front(slot);
        Some(&mut self.node_mut(slot).value)
    }

    /// Peek without touching the access order.
    pub fn peek(&self, key: K) -> Option<&V> {
        let slot = *self.map.get(&key)?;
        Some(&self.node(slot).value)
    }

    pub fn contains(&self, key: K) -> bool {
        self.map.contains_key(&key)
    }

    pub fn remove(&mut self, key: K) -> Option<V> {
        let slot = self.map.remove(&key)?;
        self.unlink(slot);
        self.free.push(slot);
        let node = self.nodes[slot].take().expect("corrupt lru slab");
        Some(node.value)
    }

    /// Keys in eviction order (least recently used first).
    pub fn keys_lru_first(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.map.len());
        let mut slot = self.tail;
        while slot != NIL {
            let node = self.node(slot);
            keys.push(node.key);
            slot = node.prev;
        }
        keys
    }

    fn node(&self, slot: usize) -> &CacheNode<K, V> {
        self.nodes[slot].as_ref().expect("corrupt lru slab")
    }

    fn node_mut(&mut self, slot: usize) -> &mut CacheNode<K, V> {
        self.nodes[slot].as_mut().expect("corrupt lru slab")
    }

    fn pop_tail(&mut self) -> Option<(K, V)> {
        if self.tail == NIL {
            return None;
        }
        let key = self.node(self.tail).key;
        self.remove(key).map(|value| (key, value))
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let node = self.node(slot);
            (node.prev, node.next)
        };
        if prev != NIL {
            self.node_mut(prev).next = next;
        } else if self.head == slot {
            self.head = next;
        }
        if next != NIL {
            self.node_mut(next).prev = prev;
        } else if self.tail == slot {
            self.tail = prev;
        }
        let node = self.node_mut(slot);
        node.prev = NIL;
        node.next = NIL;
    }

    fn push_front(&mut self, slot: usize) {
        let head = self.head;
        {
            let node = self.node_mut(slot);
            node.prev = NIL;
            node.next = head;
        }
        if head != NIL {
            self.node_mut(head).prev = slot;
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn eviction_order() {
        let mut cache = LruCache::new(3);
        assert!(cache.insert(1, 1).is_none());
        assert!(cache.insert(2, 2).is_none());
        assert!(cache.insert(3, 3).is_none());

        // touch 1 so 2 becomes the eviction candidate
        assert_eq!(cache.get_mut(1), Some(&mut 1));
        assert_eq!(cache.insert(4, 4), Some((2, 2)));

        assert_eq!(cache.len(), 3);
        assert!(cache.contains(1));
        assert!(!cache.contains(2));
        assert!(cache.contains(3));
        assert!(cache.contains(4));
    }

    #[test]
    fn update_does_not_evict() {
        let mut cache = LruCache::new(2);
        cache.insert(1, 10);
        cache.insert(2, 20);
        assert!(cache.insert(1, 11).is_none());
        assert_eq!(cache.peek(1), Some(&11));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn remove_and_reuse() {
        let mut cache = LruCache::new(2);
        cache.insert(1, 1);
        assert_eq!(cache.remove(1), Some(1));
        assert_eq!(cache.remove(1), None);
        cache.insert(2, 2);
        cache.insert(3, 3);
        cache.insert(4, 4);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.keys_lru_first(), vec![3, 4]);
    }
}
