use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use dbs_api_types::BlockMapping;

/// A block mapping transition whose referenced containers are not all
/// committed yet.
#[derive(Clone, Debug)]
pub struct VolatileBlockEntry {
    pub original: BlockMapping,
    pub modified: BlockMapping,
    pub open_containers: BTreeSet<u64>,
    pub write_event_log_id: u64,
}

/// A transition that can never complete because one of its containers
/// failed to commit.
#[derive(Clone, Debug)]
pub struct FailedVolatileBlock {
    pub original: BlockMapping,
    pub modified: BlockMapping,
    pub write_event_log_id: u64,
}

struct VolatileState {
    entries: HashMap<(u64, u32), VolatileBlockEntry>,
    by_container: HashMap<u64, HashSet<(u64, u32)>>,
}

/// Tracks in-flight block mapping transitions until every referenced
/// container id reaches `Committed`.
///
/// Ready transitions are pushed onto a channel consumed by the background
/// importer; failed ones are returned to the caller for write-failure
/// handling.
pub struct VolatileBlockStore {
    state: Mutex<VolatileState>,
    ready_tx: Sender<(u64, u32)>,
    ready_rx: Receiver<(u64, u32)>,
}

impl Default for VolatileBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VolatileBlockStore {
    pub fn new() -> Self {
        let (ready_tx, ready_rx) = unbounded();
        Self {
            state: Mutex::new(VolatileState {
                entries: HashMap::new(),
                by_container: HashMap::new(),
            }),
            ready_tx,
            ready_rx,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().entries.is_empty()
    }

    /// Track a transition. With no open containers the transition is ready
    /// immediately.
    pub fn register(
        &self,
        original: BlockMapping,
        modified: BlockMapping,
        open_containers: BTreeSet<u64>,
        write_event_log_id: u64,
    ) {
        let key = (modified.block_id, modified.version);
        if open_containers.is_empty() {
            let _ = self.ready_tx.send(key);
            return;
        }

        let mut state = self.state.lock().unwrap();
        for container in &open_containers {
            state.by_container.entry(*container).or_default().insert(key);
        }
        state.entries.insert(
            key,
            VolatileBlockEntry {
                original,
                modified,
                open_containers,
                write_event_log_id,
            },
        );
    }

    /// A container committed: entries no longer waiting on anything become
    /// ready.
    pub fn on_container_committed(&self, container_id: u64) {
        let mut state = self.state.lock().unwrap();
        let keys = match state.by_container.remove(&container_id) {
            Some(keys) => keys,
            None => return,
        };
        for key in keys {
            let ready = match state.entries.get_mut(&key) {
                Some(entry) => {
                    entry.open_containers.remove(&container_id);
                    entry.open_containers.is_empty()
                }
                None => false,
            };
            if ready {
                state.entries.remove(&key);
                let _ = self.ready_tx.send(key);
            }
        }
    }

    /// A container can never commit: every transition referencing it has
    /// failed.
    pub fn on_container_commit_failed(&self, container_id: u64) -> Vec<FailedVolatileBlock> {
        let mut state = self.state.lock().unwrap();
        let keys = match state.by_container.remove(&container_id) {
            Some(keys) => keys,
            None => return Vec::new(),
        };
        let mut failed = Vec::new();
        for key in keys {
            if let Some(entry) = state.entries.remove(&key) {
                for container in &entry.open_containers {
                    if let Some(set) = state.by_container.get_mut(container) {
                        set.remove(&key);
                    }
                }
                failed.push(FailedVolatileBlock {
                    original: entry.original,
                    modified: entry.modified,
                    write_event_log_id: entry.write_event_log_id,
                });
            }
        }
        failed
    }

    /// Collect up to `max` ready transitions, waiting up to `timeout` for
    /// the first one.
    pub fn take_ready(&self, max: usize, timeout: Duration) -> Vec<(u64, u32)> {
        let mut batch = Vec::new();
        match self.ready_rx.recv_timeout(timeout) {
            Ok(key) => batch.push(key),
            Err(_) => return batch,
        }
        while batch.len() < max {
            match self.ready_rx.try_recv() {
                Ok(key) => batch.push(key),
                Err(_) => break,
            }
        }
        batch
    }

    /// Put a contested transition back for a later round.
    pub fn requeue(&self, key: (u64, u32)) {
        let _ = self.ready_tx.send(key);
    }

    /// Remove and return every still-open transition (end of dirty start).
    pub fn drain_open(&self) -> Vec<FailedVolatileBlock> {
        let mut state = self.state.lock().unwrap();
        state.by_container.clear();
        state
            .entries
            .drain()
            .map(|(_, entry)| FailedVolatileBlock {
                original: entry.original,
                modified: entry.modified,
                write_event_log_id: entry.write_event_log_id,
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn mapping(block_id: u64, version: u32) -> BlockMapping {
        let mut mapping = BlockMapping::empty_template(block_id, 4096, 20);
        mapping.version = version;
        mapping
    }

    #[test]
    fn ready_after_all_commits() {
        let store = VolatileBlockStore::new();
        store.register(
            mapping(1, 0),
            mapping(1, 1),
            [10u64, 11].into_iter().collect(),
            100,
        );
        assert_eq!(store.len(), 1);
        assert!(store.take_ready(8, Duration::from_millis(1)).is_empty());

        store.on_container_committed(10);
        assert!(store.take_ready(8, Duration::from_millis(1)).is_empty());

        store.on_container_committed(11);
        assert_eq!(
            store.take_ready(8, Duration::from_millis(100)),
            vec![(1, 1)]
        );
        assert!(store.is_empty());
    }

    #[test]
    fn no_open_containers_is_immediately_ready() {
        let store = VolatileBlockStore::new();
        store.register(mapping(2, 0), mapping(2, 1), BTreeSet::new(), 5);
        assert_eq!(store.take_ready(8, Duration::from_millis(100)), vec![(2, 1)]);
    }

    #[test]
    fn commit_failure_fails_the_transition() {
        let store = VolatileBlockStore::new();
        store.register(
            mapping(3, 0),
            mapping(3, 1),
            [20u64, 21].into_iter().collect(),
            7,
        );
        store.on_container_committed(20);
        let failed = store.on_container_commit_failed(21);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].modified.block_id, 3);
        assert_eq!(failed[0].write_event_log_id, 7);
        assert!(store.is_empty());
    }
}
