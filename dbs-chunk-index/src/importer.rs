use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};

use crate::ChunkIndex;

/// Background importer of committed containers.
///
/// Pulls ids from the container tracker and reflects each container's items
/// in the chunk index. Contested or not-yet-readable containers are pushed
/// back and retried on the next round.
pub struct ChunkImporter {
    wake_tx: Sender<()>,
    shutdown: Arc<AtomicBool>,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl ChunkImporter {
    pub fn start(index: Arc<ChunkIndex>, threads: usize, idle_interval: Duration) -> Self {
        let (wake_tx, wake_rx) = bounded::<()>(16);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for worker in 0..threads.max(1) {
            let index = Arc::clone(&index);
            let wake_rx = wake_rx.clone();
            let shutdown = Arc::clone(&shutdown);
            let handle = std::thread::Builder::new()
                .name(format!("chunk-import-{worker}"))
                .spawn(move || {
                    while !shutdown.load(Ordering::SeqCst) {
                        match index.tracker().next_processing_container() {
                            Some(container_id) => {
                                match index.import_container(container_id) {
                                    Ok(()) => {
                                        if let Err(err) =
                                            index.tracker().processed_container(container_id)
                                        {
                                            log::error!(
                                                "tracker update for container {container_id} failed - {err:#}"
                                            );
                                        }
                                    }
                                    Err(err) => {
                                        log::debug!(
                                            "import of container {container_id} postponed - {err}"
                                        );
                                        index.tracker().abort_processing_container(container_id);
                                        let _ = wake_rx.recv_timeout(Duration::from_millis(100));
                                    }
                                }
                            }
                            None => {
                                let _ = wake_rx.recv_timeout(idle_interval);
                            }
                        }
                    }
                })
                .expect("unable to spawn chunk importer");
            handles.push(handle);
        }

        Self {
            wake_tx,
            shutdown,
            handles: Mutex::new(handles),
        }
    }

    /// Hint that a new container is trackable.
    pub fn wake(&self) {
        let _ = self.wake_tx.try_send(());
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for _ in 0..16 {
            let _ = self.wake_tx.try_send(());
        }
        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                log::error!("chunk importer thread panicked");
            }
        }
    }
}
