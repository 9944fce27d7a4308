//! Write-ahead operations log.
//!
//! Every metadata mutation of the engine is sequenced through this log
//! before the mutating subsystem updates its own persistent state. The log
//! is a fixed-size ring of fixed-size pages in a dedicated file; records are
//! page-aligned, CRC-protected and carry monotonically increasing log ids.
//! Consumers receive events in three modes, see [`ReplayMode`].

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};

use dbs_api_types::{ErrorContext, ErrorFlags};
use dbs_index::InfoStore;
use dbs_tools::fs::open_file;
use nix::fcntl::OFlag;

mod event;
pub use event::{Event, LogConsumer, LogReplayContext, ReplayMode};

/// Returned (wrapped in `anyhow::Error`) by a consumer that cannot process
/// a background-replay event *yet* — typically a block mapping whose
/// containers are still open. Background replay stops in front of the
/// event, keeping it pending, and retries on the next round. Dirty-start
/// and direct dispatch never defer.
#[derive(Debug)]
pub struct ReplayDeferred;

impl std::fmt::Display for ReplayDeferred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "event is not replayable yet")
    }
}

impl std::error::Error for ReplayDeferred {}

mod replay;
pub use replay::{run_dirty_start_replay, BackgroundReplay};

// openssl::sha::sha256(b"dedup blockstore operations log record v1.0")[0..8]
pub const OPLOG_RECORD_MAGIC_1_0: [u8; 8] = [88, 24, 203, 161, 45, 94, 170, 7];

const RECORD_HEADER_SIZE: usize = 24; // magic 8 + crc 4 + log_id 8 + payload_len 4

const CURSOR_RECORD_KEY: &str = "oplog-cursor";

#[derive(Clone, Debug)]
pub struct OpLogConfig {
    /// Total ring size in bytes.
    pub size: u64,
    pub page_size: usize,
    /// fdatasync after every appended record.
    pub sync_commits: bool,
    pub file_mode: u32,
}

impl Default for OpLogConfig {
    fn default() -> Self {
        Self {
            size: 64 * 1024 * 1024,
            page_size: 4096,
            sync_commits: true,
            file_mode: 0o640,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct CursorRecord {
    log_id: u64,
    page: u64,
}

struct LogState {
    head_page: u64,
    next_log_id: u64,
    cursor_page: u64,
    cursor_log_id: u64,
    used_pages: u64,
}

/// The operations log.
pub struct OpLog {
    file: File,
    path: PathBuf,
    page_size: usize,
    page_count: u64,
    sync_commits: bool,
    info: Arc<InfoStore>,
    consumers: RwLock<Vec<Arc<dyn LogConsumer>>>,
    state: Mutex<LogState>,
    dispatch_lock: Mutex<()>,
    replay_lock: Mutex<()>,
}

impl OpLog {
    pub fn create<P: AsRef<Path>>(
        path: P,
        config: &OpLogConfig,
        info: Arc<InfoStore>,
    ) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            bail!("operations log {path:?} already exists");
        }
        let page_count = config.size / config.page_size as u64;
        if page_count < 8 {
            bail!("operations log would have only {page_count} pages");
        }

        let file = open_file(
            &path,
            OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL,
            config.file_mode,
        )?;
        nix::unistd::ftruncate(file.as_raw_fd(), (page_count * config.page_size as u64) as i64)?;

        info.set(CURSOR_RECORD_KEY, &CursorRecord { log_id: 1, page: 0 })?;

        Ok(Self {
            file,
            path,
            page_size: config.page_size,
            page_count,
            sync_commits: config.sync_commits,
            info,
            consumers: RwLock::new(Vec::new()),
            state: Mutex::new(LogState {
                head_page: 0,
                next_log_id: 1,
                cursor_page: 0,
                cursor_log_id: 1,
                used_pages: 0,
            }),
            dispatch_lock: Mutex::new(()),
            replay_lock: Mutex::new(()),
        })
    }

    pub fn open<P: AsRef<Path>>(
        path: P,
        config: &OpLogConfig,
        info: Arc<InfoStore>,
    ) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let file = open_file(&path, OFlag::O_RDWR, config.file_mode)?;

        let len = file.metadata()?.len();
        let page_count = len / config.page_size as u64;
        if page_count * config.page_size as u64 != len || page_count < 8 {
            bail!("operations log {path:?} has unexpected size {len}");
        }

        let cursor: CursorRecord = info
            .get(CURSOR_RECORD_KEY)?
            .ok_or_else(|| format_err!("operations log cursor record missing"))?;

        let log = Self {
            file,
            path,
            page_size: config.page_size,
            page_count,
            sync_commits: config.sync_commits,
            info,
            consumers: RwLock::new(Vec::new()),
            state: Mutex::new(LogState {
                head_page: cursor.page,
                next_log_id: cursor.log_id,
                cursor_page: cursor.page,
                cursor_log_id: cursor.log_id,
                used_pages: 0,
            }),
            dispatch_lock: Mutex::new(()),
            replay_lock: Mutex::new(()),
        };
        log.scan_head()?;
        Ok(log)
    }

    /// Walk the ring from the cursor to find the head after a restart.
    ///
    /// Records carry sequential log ids, so the first page without a valid
    /// record of the expected id is the head.
    fn scan_head(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let mut page = state.cursor_page;
        let mut expected = state.cursor_log_id;
        let mut used = 0u64;

        while used < self.page_count {
            match self.parse_record_at(page) {
                Ok(Some((log_id, _event, record_pages))) if log_id == expected => {
                    expected += 1;
                    used += record_pages;
                    page = (page + record_pages) % self.page_count;
                }
                _ => break,
            }
        }

        state.head_page = page;
        state.next_log_id = expected;
        state.used_pages = used;
        log::info!(
            "operations log {:?}: {} pending events, head at page {}",
            self.path,
            expected - state.cursor_log_id,
            page
        );
        Ok(())
    }

    pub fn register_consumer(&self, consumer: Arc<dyn LogConsumer>) {
        self.consumers.write().unwrap().push(consumer);
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    /// Number of events committed but not yet consumed by background replay.
    pub fn pending_count(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state.next_log_id - state.cursor_log_id
    }

    pub fn last_committed_log_id(&self) -> u64 {
        self.state.lock().unwrap().next_log_id - 1
    }

    fn page_offset(&self, page: u64) -> u64 {
        page * self.page_size as u64
    }

    fn write_ring(&self, page: u64, data: &[u8]) -> Result<(), Error> {
        debug_assert!(data.len() % self.page_size == 0);
        let pages = (data.len() / self.page_size) as u64;
        let first = (self.page_count - page).min(pages) as usize * self.page_size;
        self.file.write_all_at(&data[..first], self.page_offset(page))?;
        if first < data.len() {
            self.file.write_all_at(&data[first..], 0)?;
        }
        Ok(())
    }

    fn read_ring(&self, page: u64, pages: u64) -> Result<Vec<u8>, Error> {
        let mut data = vec![0u8; (pages * self.page_size as u64) as usize];
        let first = (self.page_count - page).min(pages) as usize * self.page_size;
        self.file.read_exact_at(&mut data[..first], self.page_offset(page))?;
        if first < data.len() {
            self.file.read_exact_at(&mut data[first..], 0)?;
        }
        Ok(data)
    }

    fn record_pages(&self, payload_len: usize) -> u64 {
        let total = RECORD_HEADER_SIZE + payload_len;
        ((total + self.page_size - 1) / self.page_size) as u64
    }

    /// Parse the record starting at `page`, if any.
    fn parse_record_at(&self, page: u64) -> Result<Option<(u64, Event, u64)>, Error> {
        let head = self.read_ring(page, 1)?;
        if head[0..8] != OPLOG_RECORD_MAGIC_1_0 {
            return Ok(None);
        }
        let stored_crc = u32::from_le_bytes(head[8..12].try_into().unwrap());
        let log_id = u64::from_le_bytes(head[12..20].try_into().unwrap());
        let payload_len = u32::from_le_bytes(head[20..24].try_into().unwrap()) as usize;

        let record_pages = self.record_pages(payload_len);
        if record_pages > self.page_count {
            return Ok(None);
        }

        let raw = if record_pages == 1 {
            head
        } else {
            self.read_ring(page, record_pages)?
        };
        let payload = &raw[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + payload_len];

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(payload);
        if hasher.finalize() != stored_crc {
            return Ok(None);
        }

        let event = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(err) => {
                log::error!("undecodable log record {log_id} in {:?} - {err}", self.path);
                return Ok(None);
            }
        };
        Ok(Some((log_id, event, record_pages)))
    }

    /// Append a typed event and dispatch it in `Direct` mode.
    ///
    /// Returns the record's log id once it is durable. A consumer failure
    /// after the durable append does not undo the commit; it is logged and
    /// the log id is returned anyway ("committed, consumer work
    /// incomplete"). If the append itself fails, no log id exists and the
    /// operation counts as not committed.
    pub fn commit_event(&self, event: &Event, ec: &mut ErrorContext) -> Result<u64, Error> {
        assert!(!event.is_synthetic(), "synthetic events are never persisted");

        let payload = serde_json::to_vec(event)?;
        let record_pages = self.record_pages(payload.len());

        let log_id = {
            let mut state = self.state.lock().unwrap();

            // one page headroom keeps head != cursor while non-empty
            let free = self.page_count - state.used_pages;
            if record_pages + 1 > free {
                ec.set(ErrorFlags::LOG_FULL);
                bail!(
                    "operations log is full ({} of {} pages used)",
                    state.used_pages,
                    self.page_count
                );
            }

            let log_id = state.next_log_id;
            let mut buffer = vec![0u8; (record_pages * self.page_size as u64) as usize];
            buffer[0..8].copy_from_slice(&OPLOG_RECORD_MAGIC_1_0);
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&payload);
            buffer[8..12].copy_from_slice(&hasher.finalize().to_le_bytes());
            buffer[12..20].copy_from_slice(&log_id.to_le_bytes());
            buffer[20..24].copy_from_slice(&(payload.len() as u32).to_le_bytes());
            buffer[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + payload.len()]
                .copy_from_slice(&payload);

            if let Err(err) = self.write_ring(state.head_page, &buffer) {
                ec.set(ErrorFlags::IO);
                return Err(err);
            }
            if self.sync_commits {
                if let Err(err) = dbs_tools::fs::datasync(&self.file) {
                    ec.set(ErrorFlags::IO);
                    return Err(err);
                }
            }

            state.head_page = (state.head_page + record_pages) % self.page_count;
            state.used_pages += record_pages;
            state.next_log_id += 1;
            log_id
        };

        self.dispatch(event, LogReplayContext {
            log_id,
            mode: ReplayMode::Direct,
        });

        Ok(log_id)
    }

    /// Dispatch an event to all consumers, serialized in commit order.
    fn dispatch(&self, event: &Event, context: LogReplayContext) {
        let _serial = self.dispatch_lock.lock().unwrap();
        let consumers = self.consumers.read().unwrap().clone();
        for consumer in consumers {
            if let Err(err) = consumer.apply(event, &context) {
                log::error!(
                    "log consumer '{}' failed on {} (log id {}) - {err:#}",
                    consumer.name(),
                    event.type_name(),
                    context.log_id
                );
            }
        }
    }

    /// Dispatch a synthetic event (never persisted).
    pub fn dispatch_synthetic(&self, event: &Event, mode: ReplayMode) -> Result<(), Error> {
        assert!(event.is_synthetic());
        let consumers = self.consumers.read().unwrap().clone();
        let context = LogReplayContext { log_id: 0, mode };
        for consumer in &consumers {
            consumer
                .apply(event, &context)
                .map_err(|err| format_err!("log consumer '{}' failed - {err}", consumer.name()))?;
        }
        Ok(())
    }

    /// Snapshot pending events starting at the replay cursor.
    pub(crate) fn collect_pending(&self, max: usize) -> Result<Vec<(u64, Event, u64)>, Error> {
        let (mut page, mut expected, head_id) = {
            let state = self.state.lock().unwrap();
            (state.cursor_page, state.cursor_log_id, state.next_log_id)
        };

        let mut batch = Vec::new();
        while expected < head_id && batch.len() < max {
            match self.parse_record_at(page)? {
                Some((log_id, event, record_pages)) if log_id == expected => {
                    page = (page + record_pages) % self.page_count;
                    expected += 1;
                    batch.push((log_id, event, record_pages));
                }
                _ => bail!(
                    "operations log {:?} lost record {expected} (expected below head {head_id})",
                    self.path
                ),
            }
        }
        Ok(batch)
    }

    fn advance_cursor(&self, consumed: &[(u64, Event, u64)]) -> Result<(), Error> {
        if consumed.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap();
        let pages: u64 = consumed.iter().map(|(_, _, p)| *p).sum();
        let last_id = consumed.last().unwrap().0;

        state.cursor_page = (state.cursor_page + pages) % self.page_count;
        state.cursor_log_id = last_id + 1;
        state.used_pages -= pages;

        self.info.set(
            CURSOR_RECORD_KEY,
            &CursorRecord {
                log_id: state.cursor_log_id,
                page: state.cursor_page,
            },
        )
    }

    /// Consume one batch of pending events in `Background` mode.
    ///
    /// Returns the number of events consumed. A consumer failure leaves the
    /// cursor untouched so the batch is retried.
    pub fn run_background_replay_once(&self, max: usize) -> Result<usize, Error> {
        let _serial = self.replay_lock.lock().unwrap();

        let batch = self.collect_pending(max)?;
        if batch.is_empty() {
            return Ok(0);
        }

        let consumers = self.consumers.read().unwrap().clone();
        let mut consumed = 0usize;
        'events: for (log_id, event, _) in &batch {
            let context = LogReplayContext {
                log_id: *log_id,
                mode: ReplayMode::Background,
            };
            for consumer in &consumers {
                if let Err(err) = consumer.apply(event, &context) {
                    if err.downcast_ref::<ReplayDeferred>().is_some() {
                        // the cursor must not pass this event yet
                        log::debug!(
                            "background replay paused at {} (log id {log_id})",
                            event.type_name()
                        );
                        break 'events;
                    }
                    return Err(format_err!(
                        "background replay: consumer '{}' failed on {} (log id {log_id}) - {err}",
                        consumer.name(),
                        event.type_name()
                    ));
                }
            }
            consumed += 1;
        }

        self.advance_cursor(&batch[..consumed])?;

        if consumed > 0 && self.pending_count() == 0 {
            self.dispatch_synthetic(&Event::LogEmpty, ReplayMode::Background)?;
        }
        Ok(consumed)
    }

    /// Drive background replay until the log is drained.
    pub fn drain_background_replay(&self) -> Result<(), Error> {
        while self.run_background_replay_once(256)? > 0 {}
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingConsumer {
        direct: AtomicU64,
        background: AtomicU64,
        last_log_id: AtomicU64,
    }

    impl LogConsumer for CountingConsumer {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn apply(&self, _event: &Event, context: &LogReplayContext) -> Result<(), Error> {
            match context.mode {
                ReplayMode::Direct => self.direct.fetch_add(1, Ordering::SeqCst),
                ReplayMode::Background => self.background.fetch_add(1, Ordering::SeqCst),
                ReplayMode::DirtyStart => 0,
            };
            self.last_log_id.store(context.log_id, Ordering::SeqCst);
            Ok(())
        }
    }

    fn testdir(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("dbs-oplog-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    fn small_config() -> OpLogConfig {
        OpLogConfig {
            size: 64 * 4096,
            page_size: 4096,
            sync_commits: false,
            file_mode: 0o640,
        }
    }

    fn sample_event(id: u64) -> Event {
        Event::ContainerOpened {
            container_id: id,
            address: dbs_api_types::ContainerAddress::Primary {
                file_index: 0,
                file_offset: id * 4096,
                log_id: 0,
            },
        }
    }

    #[test]
    fn commit_dispatch_replay() {
        let dir = testdir("basic");
        let info = Arc::new(InfoStore::open(dir.join("info"), 0o750, 0o640).unwrap());
        let log = OpLog::create(dir.join("oplog"), &small_config(), info).unwrap();

        let consumer = Arc::new(CountingConsumer {
            direct: AtomicU64::new(0),
            background: AtomicU64::new(0),
            last_log_id: AtomicU64::new(0),
        });
        log.register_consumer(consumer.clone());

        let mut ec = ErrorContext::new();
        for id in 1..=10u64 {
            let log_id = log.commit_event(&sample_event(id), &mut ec).unwrap();
            assert_eq!(log_id, id);
        }
        assert_eq!(consumer.direct.load(Ordering::SeqCst), 10);
        assert_eq!(log.pending_count(), 10);

        log.drain_background_replay().unwrap();
        assert_eq!(consumer.background.load(Ordering::SeqCst), 10);
        assert_eq!(log.pending_count(), 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn reopen_recovers_pending_events() {
        let dir = testdir("reopen");
        let info = Arc::new(InfoStore::open(dir.join("info"), 0o750, 0o640).unwrap());
        let mut ec = ErrorContext::new();

        {
            let log = OpLog::create(dir.join("oplog"), &small_config(), info.clone()).unwrap();
            for id in 1..=5u64 {
                log.commit_event(&sample_event(id), &mut ec).unwrap();
            }
        }

        let log = OpLog::open(dir.join("oplog"), &small_config(), info).unwrap();
        assert_eq!(log.pending_count(), 5);
        assert_eq!(log.last_committed_log_id(), 5);

        let batch = log.collect_pending(usize::MAX).unwrap();
        assert_eq!(batch.len(), 5);
        assert_eq!(batch[0].0, 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn log_full_backpressure() {
        let dir = testdir("full");
        let info = Arc::new(InfoStore::open(dir.join("info"), 0o750, 0o640).unwrap());
        let config = OpLogConfig {
            size: 8 * 4096,
            ..small_config()
        };
        let log = OpLog::create(dir.join("oplog"), &config, info).unwrap();

        let mut ec = ErrorContext::new();
        let mut committed = 0;
        for id in 1..=20u64 {
            if log.commit_event(&sample_event(id), &mut ec).is_err() {
                break;
            }
            committed += 1;
        }
        assert!(committed < 20);
        assert!(ec.contains(ErrorFlags::LOG_FULL));

        // draining the backlog frees ring space again
        log.drain_background_replay().unwrap();
        log.commit_event(&sample_event(99), &mut ec).unwrap();

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn ring_wraps_across_boundary() {
        let dir = testdir("wrap");
        let info = Arc::new(InfoStore::open(dir.join("info"), 0o750, 0o640).unwrap());
        let config = OpLogConfig {
            size: 8 * 4096,
            ..small_config()
        };
        let log = OpLog::create(dir.join("oplog"), &config, info).unwrap();

        let mut ec = ErrorContext::new();
        for round in 0..10u64 {
            for id in 0..4u64 {
                log.commit_event(&sample_event(round * 4 + id), &mut ec).unwrap();
            }
            log.drain_background_replay().unwrap();
        }
        assert_eq!(log.pending_count(), 0);
        assert_eq!(log.last_committed_log_id(), 40);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
