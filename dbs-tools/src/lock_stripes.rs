//! Striped lock pools.
//!
//! Container ids, block ids and fingerprint prefixes are guarded by fixed
//! pools of locks indexed by key modulo pool width, bounding lock memory
//! independently of the key space.

use std::sync::{Mutex, RwLock};

pub struct LockStripes<L> {
    stripes: Vec<L>,
}

impl<L> LockStripes<L> {
    pub fn with(count: usize, init: impl Fn() -> L) -> Self {
        let count = count.max(1);
        let mut stripes = Vec::with_capacity(count);
        for _ in 0..count {
            stripes.push(init());
        }
        Self { stripes }
    }

    pub fn stripe(&self, key: u64) -> &L {
        &self.stripes[(key % self.stripes.len() as u64) as usize]
    }

    /// Stripe index for a key. Two keys on the same stripe share a lock, so
    /// callers acquiring multiple stripes must order by index and skip
    /// duplicates.
    pub fn stripe_index(&self, key: u64) -> usize {
        (key % self.stripes.len() as u64) as usize
    }

    pub fn len(&self) -> usize {
        self.stripes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stripes.is_empty()
    }
}

pub type RwLockStripes = LockStripes<RwLock<()>>;
pub type MutexStripes = LockStripes<Mutex<()>>;

pub fn rwlock_stripes(count: usize) -> RwLockStripes {
    LockStripes::with(count, || RwLock::new(()))
}

pub fn mutex_stripes(count: usize) -> MutexStripes {
    LockStripes::with(count, || Mutex::new(()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn same_key_same_stripe() {
        let stripes = rwlock_stripes(8);
        assert_eq!(stripes.stripe_index(13), stripes.stripe_index(13));
        assert_eq!(stripes.stripe_index(5), stripes.stripe_index(5 + 8));
    }

    #[test]
    fn guards_are_usable() {
        let stripes = mutex_stripes(4);
        let _a = stripes.stripe(1).lock().unwrap();
        let _b = stripes.stripe(2).lock().unwrap();
    }
}
