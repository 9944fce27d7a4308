use std::sync::Mutex;
use std::time::{Duration, Instant};

use dbs_api_types::Fingerprint;

use crate::container::Container;

/// An open container being filled, together with its pre-assigned slot.
pub struct OpenContainer {
    pub container: Container,
    pub file_index: u16,
    pub slot: u64,
    pub opened_at: Instant,
}

/// Small pool of currently-open containers.
///
/// Chunks are appended to whichever open container fits; full or aged
/// containers are taken out and handed to the background committer.
pub struct ContainerWriteCache {
    slots: Mutex<Vec<Option<OpenContainer>>>,
}

impl ContainerWriteCache {
    pub fn new(width: usize) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(width.max(1), || None);
        Self {
            slots: Mutex::new(slots),
        }
    }

    /// Append to the first open container the payload fits into.
    /// Returns the container id on success.
    pub fn append_to_fitting(
        &self,
        key: Fingerprint,
        payload: &[u8],
        is_indexed: bool,
    ) -> Option<u64> {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut().flatten() {
            if slot.container.find_item(&key).is_some() {
                // duplicate within the open container, nothing to store
                return Some(slot.container.primary_id());
            }
            if slot.container.fits(payload.len()) {
                let id = slot.container.primary_id();
                slot.container
                    .add_item(key, payload.to_vec(), is_indexed)
                    .ok()?;
                return Some(id);
            }
        }
        None
    }

    /// Install a freshly opened container and append the first chunk.
    /// Gives the container back when no free slot is left.
    pub fn install_and_append(
        &self,
        mut open: OpenContainer,
        key: Fingerprint,
        payload: &[u8],
        is_indexed: bool,
    ) -> Result<u64, OpenContainer> {
        let mut slots = self.slots.lock().unwrap();
        match slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                let id = open.container.primary_id();
                if open
                    .container
                    .add_item(key, payload.to_vec(), is_indexed)
                    .is_err()
                {
                    return Err(open);
                }
                *slot = Some(open);
                Ok(id)
            }
            None => Err(open),
        }
    }

    /// Take the fullest open container for handover, but only when every
    /// slot is occupied.
    pub fn take_handover_candidate(&self) -> Option<OpenContainer> {
        let mut slots = self.slots.lock().unwrap();
        if slots.iter().any(|slot| slot.is_none()) {
            return None;
        }
        let victim = slots
            .iter()
            .enumerate()
            .filter_map(|(pos, slot)| {
                slot.as_ref()
                    .map(|open| (pos, open.container.active_data_size()))
            })
            .max_by_key(|(_, size)| *size)?
            .0;
        slots[victim].take()
    }

    /// Take every non-empty container older than `timeout`.
    pub fn take_expired(&self, timeout: Duration) -> Vec<OpenContainer> {
        let mut slots = self.slots.lock().unwrap();
        let now = Instant::now();
        let mut expired = Vec::new();
        for slot in slots.iter_mut() {
            let aged = slot
                .as_ref()
                .map(|open| {
                    !open.container.is_empty()
                        && now.duration_since(open.opened_at) >= timeout
                })
                .unwrap_or(false);
            if aged {
                expired.push(slot.take().unwrap());
            }
        }
        expired
    }

    /// Take every non-empty container (write-back shutdown).
    pub fn take_all_nonempty(&self) -> Vec<OpenContainer> {
        let mut slots = self.slots.lock().unwrap();
        let mut taken = Vec::new();
        for slot in slots.iter_mut() {
            if slot
                .as_ref()
                .map(|open| !open.container.is_empty())
                .unwrap_or(false)
            {
                taken.push(slot.take().unwrap());
            }
        }
        taken
    }

    /// Drop every open container (forced stop / failed start).
    pub fn drop_all(&self) -> Vec<OpenContainer> {
        let mut slots = self.slots.lock().unwrap();
        slots.iter_mut().filter_map(|slot| slot.take()).collect()
    }

    pub fn contains_id(&self, id: u64) -> bool {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .flatten()
            .any(|open| open.container.primary_id() == id)
    }

    /// Serve a chunk still sitting in an open container.
    pub fn find_chunk(&self, id: u64, key: &Fingerprint) -> Option<Vec<u8>> {
        let slots = self.slots.lock().unwrap();
        for open in slots.iter().flatten() {
            if open.container.primary_id() == id {
                return open
                    .container
                    .find_item(key)
                    .map(|item| item.payload().to_vec());
            }
        }
        None
    }

    pub fn open_ids(&self) -> Vec<u64> {
        let slots = self.slots.lock().unwrap();
        slots
            .iter()
            .flatten()
            .map(|open| open.container.primary_id())
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint::new(&[byte; 20]).unwrap()
    }

    fn open(id: u64, capacity: usize) -> OpenContainer {
        OpenContainer {
            container: Container::new(id, capacity),
            file_index: 0,
            slot: id,
            opened_at: Instant::now(),
        }
    }

    #[test]
    fn append_and_handover() {
        let cache = ContainerWriteCache::new(2);
        assert!(cache.append_to_fitting(fp(1), b"data", true).is_none());

        let id = cache
            .install_and_append(open(1, 64 * 1024), fp(1), b"data", true)
            .unwrap();
        assert_eq!(id, 1);
        assert_eq!(cache.append_to_fitting(fp(2), b"more", true), Some(1));

        // a free slot left: no handover yet
        assert!(cache.take_handover_candidate().is_none());

        cache
            .install_and_append(open(2, 64 * 1024), fp(3), b"x", true)
            .unwrap();
        let victim = cache.take_handover_candidate().unwrap();
        assert_eq!(victim.container.primary_id(), 1); // the fuller one
        assert!(!cache.contains_id(1));
        assert!(cache.contains_id(2));
    }

    #[test]
    fn chunk_visible_while_open() {
        let cache = ContainerWriteCache::new(1);
        cache
            .install_and_append(open(5, 64 * 1024), fp(7), b"payload", true)
            .unwrap();
        assert_eq!(cache.find_chunk(5, &fp(7)), Some(b"payload".to_vec()));
        assert_eq!(cache.find_chunk(5, &fp(8)), None);
        assert_eq!(cache.find_chunk(6, &fp(7)), None);
    }

    #[test]
    fn expiry_skips_empty_containers() {
        let cache = ContainerWriteCache::new(2);
        cache
            .install_and_append(open(1, 64 * 1024), fp(1), b"d", true)
            .unwrap();
        let mut empty = open(2, 64 * 1024);
        empty.opened_at = Instant::now() - Duration::from_secs(120);
        {
            let mut slots = cache.slots.lock().unwrap();
            slots[1] = Some(empty);
        }
        let expired = cache.take_expired(Duration::from_secs(60));
        assert!(expired.is_empty());
    }
}
