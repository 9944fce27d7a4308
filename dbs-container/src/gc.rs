use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Error;
use crossbeam_channel::{bounded, Receiver};

use dbs_api_types::{ErrorContext, Fingerprint};

use crate::storage::{ContainerStorage, GcNotification};

/// Decides whether a chunk may be dropped when its container is rewritten.
///
/// Implemented by the chunk index: a chunk is garbage when its usage count
/// is zero and no in-combat guard is held.
pub trait ChunkGarbage: Send + Sync {
    fn is_garbage(&self, key: &Fingerprint) -> bool;

    /// The keys were dropped from container storage; forget their index
    /// entries.
    fn forget(&self, keys: &[Fingerprint]);
}

#[derive(Clone, Debug)]
pub struct GcConfig {
    pub enabled: bool,
    /// Containers below this share of the container size are merge
    /// candidates.
    pub merge_utilization: f64,
    pub scan_interval: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            merge_utilization: 0.35,
            scan_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    active_data_size: u64,
    item_count: u32,
}

/// Background merge of sparse containers, delete of empty ones.
///
/// Candidates are learned from commit/merge/move/delete notifications (and
/// from replay, which re-delivers them). All structural work goes through
/// the storage's try-operations, so contested locks abort instead of
/// stalling foreground traffic.
pub struct ContainerGc {
    storage: Arc<ContainerStorage>,
    garbage: Arc<dyn ChunkGarbage>,
    config: GcConfig,
    candidates: Mutex<HashMap<u64, Candidate>>,
    notifications: Receiver<GcNotification>,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ContainerGc {
    pub fn new(
        storage: Arc<ContainerStorage>,
        garbage: Arc<dyn ChunkGarbage>,
        config: GcConfig,
    ) -> Arc<Self> {
        let (tx, rx) = bounded(1024);
        storage.set_gc_notifier(tx);
        Arc::new(Self {
            storage,
            garbage,
            config,
            candidates: Mutex::new(HashMap::new()),
            notifications: rx,
            shutdown: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            return;
        }
        let gc = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("container-gc".to_string())
            .spawn(move || {
                while !gc.shutdown.load(Ordering::SeqCst) {
                    if let Err(err) = gc.run_once() {
                        log::error!("container gc cycle failed - {err:#}");
                    }
                    match gc.notifications.recv_timeout(gc.config.scan_interval) {
                        Ok(notification) => gc.absorb_notification(notification),
                        Err(_) => {} // timeout or disconnect, run another cycle
                    }
                }
            })
            .expect("unable to spawn container gc");
        *self.handle.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            if handle.join().is_err() {
                log::error!("container gc thread panicked");
            }
        }
    }

    fn absorb_notification(&self, notification: GcNotification) {
        let mut candidates = self.candidates.lock().unwrap();
        match notification {
            GcNotification::Committed {
                container_id,
                active_data_size,
                item_count,
            } => {
                candidates.insert(
                    container_id,
                    Candidate {
                        active_data_size,
                        item_count,
                    },
                );
            }
            GcNotification::Merged {
                new_primary_id,
                old_ids,
                active_data_size,
                item_count,
            } => {
                for id in old_ids {
                    candidates.remove(&id);
                }
                candidates.insert(
                    new_primary_id,
                    Candidate {
                        active_data_size,
                        item_count,
                    },
                );
            }
            GcNotification::Moved {
                container_id,
                active_data_size,
                item_count,
            } => {
                candidates.insert(
                    container_id,
                    Candidate {
                        active_data_size,
                        item_count,
                    },
                );
            }
            GcNotification::Deleted { container_id } => {
                candidates.remove(&container_id);
            }
        }
    }

    fn drain_notifications(&self) {
        while let Ok(notification) = self.notifications.try_recv() {
            self.absorb_notification(notification);
        }
    }

    /// One full GC cycle: delete empties, merge the two sparsest
    /// candidates. Also driven directly by tests and the flush path.
    pub fn run_once(&self) -> Result<(), Error> {
        self.drain_notifications();

        let capacity = self.storage.container_size() as u64;
        let threshold = (capacity as f64 * self.config.merge_utilization) as u64;

        let snapshot: Vec<(u64, Candidate)> = {
            let candidates = self.candidates.lock().unwrap();
            candidates.iter().map(|(id, c)| (*id, *c)).collect()
        };

        // empty containers can go right away
        for (id, candidate) in &snapshot {
            if candidate.active_data_size == 0 {
                let mut ec = ErrorContext::new();
                if self.storage.try_delete_container(*id, &mut ec)? {
                    self.candidates.lock().unwrap().remove(id);
                }
            }
        }

        let mut sparse: Vec<(u64, Candidate)> = snapshot
            .into_iter()
            .filter(|(_, c)| c.active_data_size > 0 && c.active_data_size < threshold)
            .collect();
        sparse.sort_by_key(|(_, c)| c.active_data_size);

        if sparse.len() >= 2 {
            let (first_id, first) = sparse[0];
            let (second_id, second) = sparse[1];
            // directory and compression overhead headroom
            if first.active_data_size + second.active_data_size <= capacity * 9 / 10 {
                let garbage = self.garbage.clone();
                let mut ec = ErrorContext::new();
                let mut keep = |key: &Fingerprint| !garbage.is_garbage(key);
                match self
                    .storage
                    .try_merge_container(first_id, second_id, &mut keep, &mut ec)?
                {
                    Some((_new_primary, dropped)) => {
                        if !dropped.is_empty() {
                            self.garbage.forget(&dropped);
                        }
                    }
                    None => {
                        log::debug!("merge of {first_id}+{second_id} contested, retrying later");
                    }
                }
            }
        } else if sparse.len() == 1 {
            // a single sparse container: compact it, but only when it
            // actually holds garbage
            let (id, _) = sparse[0];
            let mut ec = ErrorContext::new();
            let container = match self.storage.read_container(id, &mut ec) {
                Ok(container) => container,
                Err(_) => {
                    // deleted or moved since the notification; forget it
                    self.candidates.lock().unwrap().remove(&id);
                    return Ok(());
                }
            };
            let has_garbage = container
                .items()
                .iter()
                .any(|item| !item.is_deleted && self.garbage.is_garbage(&item.key));
            if item_garbage_worth_moving(&container, has_garbage) {
                let garbage = self.garbage.clone();
                let mut keep = |key: &Fingerprint| !garbage.is_garbage(key);
                if let Some(dropped) = self.storage.try_move_container(id, &mut keep, &mut ec)? {
                    if !dropped.is_empty() {
                        self.garbage.forget(&dropped);
                    }
                }
            }
        }

        Ok(())
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.lock().unwrap().len()
    }
}

fn item_garbage_worth_moving(container: &crate::container::Container, has_garbage: bool) -> bool {
    has_garbage || container.item_count() != container.active_item_count()
}
