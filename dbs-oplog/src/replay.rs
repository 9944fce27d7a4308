//! Replay coordination.
//!
//! Dirty start replay rebuilds in-memory state at boot; the background
//! replay worker continuously drains durable events to do persistence work.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{format_err, Error};
use crossbeam_channel::{bounded, Sender};

use crate::{Event, LogReplayContext, OpLog, ReplayMode};

/// Replay the pending log in `DirtyStart` mode to rebuild in-memory state.
///
/// The replay cursor is not advanced; the same events are consumed again by
/// background replay for persistence work once the system is running.
/// Consumer failures abort startup.
pub fn run_dirty_start_replay(oplog: &OpLog) -> Result<u64, Error> {
    oplog.dispatch_synthetic(
        &Event::ReplayStarted {
            full_log_replay: true,
        },
        ReplayMode::DirtyStart,
    )?;

    let result = dirty_start_pass(oplog);

    oplog.dispatch_synthetic(
        &Event::ReplayStopped {
            replay_type: ReplayMode::DirtyStart,
            success: result.is_ok(),
        },
        ReplayMode::DirtyStart,
    )?;

    result
}

fn dirty_start_pass(oplog: &OpLog) -> Result<u64, Error> {
    let batch = oplog.collect_pending(usize::MAX)?;
    let count = batch.len() as u64;

    let consumers = oplog.consumers.read().unwrap().clone();
    for (log_id, event, _) in &batch {
        let context = LogReplayContext {
            log_id: *log_id,
            mode: ReplayMode::DirtyStart,
        };
        for consumer in &consumers {
            consumer.apply(event, &context).map_err(|err| {
                format_err!(
                    "dirty start replay: consumer '{}' failed on {} (log id {log_id}) - {err}",
                    consumer.name(),
                    event.type_name()
                )
            })?;
        }
    }

    log::info!("dirty start replay processed {count} events");
    Ok(count)
}

/// Handle of the continuous background replay worker.
pub struct BackgroundReplay {
    wake_tx: Sender<WorkerSignal>,
    handle: Option<JoinHandle<()>>,
}

enum WorkerSignal {
    Wake,
    Shutdown,
}

impl BackgroundReplay {
    /// Spawn the worker. It consumes `batch_size` events per round and
    /// parks for `idle_interval` when the log is drained.
    pub fn start(oplog: Arc<OpLog>, batch_size: usize, idle_interval: Duration) -> Self {
        let (wake_tx, wake_rx) = bounded::<WorkerSignal>(16);

        let handle = std::thread::Builder::new()
            .name("oplog-replay".to_string())
            .spawn(move || {
                loop {
                    match oplog.run_background_replay_once(batch_size) {
                        Ok(0) => {
                            match wake_rx.recv_timeout(idle_interval) {
                                Ok(WorkerSignal::Shutdown) => break,
                                Ok(WorkerSignal::Wake) => continue,
                                Err(_) => continue, // timeout, poll again
                            }
                        }
                        Ok(_) => {
                            // drained a batch, check for shutdown without blocking
                            match wake_rx.try_recv() {
                                Ok(WorkerSignal::Shutdown) => break,
                                _ => continue,
                            }
                        }
                        Err(err) => {
                            log::error!("background replay failed - {err:#}");
                            match wake_rx.recv_timeout(idle_interval) {
                                Ok(WorkerSignal::Shutdown) => break,
                                _ => continue,
                            }
                        }
                    }
                }
                if let Err(err) = oplog.dispatch_synthetic(
                    &Event::ReplayStopped {
                        replay_type: ReplayMode::Background,
                        success: true,
                    },
                    ReplayMode::Background,
                ) {
                    log::error!("replay stop dispatch failed - {err:#}");
                }
            })
            .expect("unable to spawn background replay worker");

        Self {
            wake_tx,
            handle: Some(handle),
        }
    }

    /// Hint that new events are available.
    pub fn wake(&self) {
        let _ = self.wake_tx.try_send(WorkerSignal::Wake);
    }

    /// Stop the worker and wait for it to exit.
    pub fn stop(&mut self) {
        let _ = self.wake_tx.send(WorkerSignal::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("background replay worker panicked");
            }
        }
    }
}

impl Drop for BackgroundReplay {
    fn drop(&mut self) {
        self.stop();
    }
}
