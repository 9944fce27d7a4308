use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use anyhow::Error;
use serde::{Deserialize, Serialize};

use dbs_index::InfoStore;

const TRACKER_RECORD_KEY: &str = "chunk-container-tracker";

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrackerRecord {
    pending: Vec<u64>,
    highest_processed: u64,
}

struct TrackerState {
    pending: BTreeSet<u64>,
    processing: BTreeSet<u64>,
    highest_processed: u64,
}

/// Persistent set of committed-but-unimported container ids.
///
/// `ContainerCommitted` registers an id, the background importer takes the
/// lowest pending id, and marks it processed once the container's items are
/// reflected in the chunk index. The pending set survives restarts; ids
/// being processed at a crash are simply processed again.
pub struct ContainerTracker {
    info: Arc<InfoStore>,
    state: Mutex<TrackerState>,
}

impl ContainerTracker {
    pub fn open(info: Arc<InfoStore>) -> Result<Self, Error> {
        let record: TrackerRecord = info.get(TRACKER_RECORD_KEY)?.unwrap_or_default();
        Ok(Self {
            info,
            state: Mutex::new(TrackerState {
                pending: record.pending.into_iter().collect(),
                processing: BTreeSet::new(),
                highest_processed: record.highest_processed,
            }),
        })
    }

    fn persist(&self, state: &TrackerState) -> Result<(), Error> {
        self.info.set(
            TRACKER_RECORD_KEY,
            &TrackerRecord {
                pending: state.pending.iter().copied().collect(),
                highest_processed: state.highest_processed,
            },
        )
    }

    /// Register a committed container. Idempotent; returns whether the id
    /// is new to the tracker.
    pub fn should_process(&self, container_id: u64) -> Result<bool, Error> {
        let mut state = self.state.lock().unwrap();
        if state.processing.contains(&container_id) || !state.pending.insert(container_id) {
            return Ok(false);
        }
        self.persist(&state)?;
        Ok(true)
    }

    /// Take the lowest pending id for import.
    pub fn next_processing_container(&self) -> Option<u64> {
        let mut state = self.state.lock().unwrap();
        let id = state.pending.iter().next().copied()?;
        state.pending.remove(&id);
        state.processing.insert(id);
        Some(id)
    }

    pub fn processed_container(&self, container_id: u64) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.processing.remove(&container_id);
        state.pending.remove(&container_id);
        state.highest_processed = state.highest_processed.max(container_id);
        self.persist(&state)
    }

    /// Put an id back after a contested or failed import attempt.
    pub fn abort_processing_container(&self, container_id: u64) {
        let mut state = self.state.lock().unwrap();
        if state.processing.remove(&container_id) {
            state.pending.insert(container_id);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn processing_count(&self) -> usize {
        self.state.lock().unwrap().processing.len()
    }

    pub fn highest_processed(&self) -> u64 {
        self.state.lock().unwrap().highest_processed
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn store(name: &str) -> Arc<InfoStore> {
        let mut dir = std::env::temp_dir();
        dir.push(format!("dbs-tracker-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        Arc::new(InfoStore::open(&dir, 0o750, 0o640).unwrap())
    }

    #[test]
    fn pending_set_survives_reopen() {
        let info = store("persist");
        let tracker = ContainerTracker::open(info.clone()).unwrap();
        assert!(tracker.should_process(3).unwrap());
        assert!(tracker.should_process(1).unwrap());
        assert!(!tracker.should_process(3).unwrap());

        let tracker = ContainerTracker::open(info).unwrap();
        assert_eq!(tracker.pending_count(), 2);
        assert_eq!(tracker.next_processing_container(), Some(1));
        tracker.processed_container(1).unwrap();
        assert_eq!(tracker.highest_processed(), 1);
    }

    #[test]
    fn abort_requeues() {
        let info = store("abort");
        let tracker = ContainerTracker::open(info).unwrap();
        tracker.should_process(7).unwrap();
        assert_eq!(tracker.next_processing_container(), Some(7));
        assert_eq!(tracker.next_processing_container(), None);
        tracker.abort_processing_container(7);
        assert_eq!(tracker.next_processing_container(), Some(7));
    }
}
