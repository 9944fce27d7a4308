use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::BlockIndex;

/// Background importer of ready block mapping transitions.
///
/// Consumes the volatile store's ready queue and moves auxiliary entries
/// into the persistent index. Also drains the queued write failures, which
/// must be handled outside of log dispatch.
pub struct BlockImporter {
    shutdown: Arc<AtomicBool>,
    handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl BlockImporter {
    pub fn start(index: Arc<BlockIndex>, threads: usize, idle_interval: Duration) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for worker in 0..threads.max(1) {
            let index = Arc::clone(&index);
            let shutdown = Arc::clone(&shutdown);
            let handle = std::thread::Builder::new()
                .name(format!("block-import-{worker}"))
                .spawn(move || {
                    while !shutdown.load(Ordering::SeqCst) {
                        match index.background_import_once(idle_interval) {
                            Ok(_) => {}
                            Err(err) => {
                                log::error!("block import round failed - {err:#}");
                                std::thread::sleep(Duration::from_millis(100));
                            }
                        }
                    }
                })
                .expect("unable to spawn block importer");
            handles.push(handle);
        }

        Self {
            shutdown,
            handles: Mutex::new(handles),
        }
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                log::error!("block importer thread panicked");
            }
        }
    }
}
