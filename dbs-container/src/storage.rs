use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::{bail, format_err, Error};
use crossbeam_channel::{bounded, Receiver, Sender};

use dbs_api_types::{
    ContainerAddress, ErrorContext, ErrorFlags, Fingerprint, StartContext,
};
use dbs_index::{DiskHashConfig, DiskHashIndex, InfoStore};
use dbs_oplog::{Event, LogConsumer, LogReplayContext, OpLog, ReplayMode};
use dbs_tools::fs::open_file;
use dbs_tools::lock_stripes::{rwlock_stripes, RwLockStripes};
use nix::fcntl::OFlag;
use serde::{Deserialize, Serialize};

use crate::allocator::ContainerAllocator;
use crate::container::Container;
use crate::read_cache::ContainerReadCache;
use crate::write_cache::{ContainerWriteCache, OpenContainer};

// openssl::sha::sha256(b"dedup blockstore container file superblock v1.0")[0..8]
pub const SUPERBLOCK_MAGIC_1_0: [u8; 8] = [61, 200, 143, 9, 77, 182, 38, 249];

const SUPERBLOCK_SIZE: u64 = 4096;
const META_VALUE_SIZE: usize = 19;

const STORAGE_HEADER_KEY: &str = "container-storage";

#[derive(Clone, Debug)]
pub struct ContainerStorageConfig {
    pub container_size: usize,
    pub file_count: u16,
    pub slots_per_file: u64,
    pub write_cache_slots: usize,
    pub committer_threads: usize,
    pub write_cache_timeout: Duration,
    pub read_cache_lines: usize,
    pub container_lock_stripes: usize,
    pub has_superblock: bool,
    pub compress: bool,
    pub meta_index_pages: u64,
    pub file_mode: u32,
}

impl Default for ContainerStorageConfig {
    fn default() -> Self {
        Self {
            container_size: 4 * 1024 * 1024,
            file_count: 1,
            slots_per_file: 1024,
            write_cache_slots: 4,
            committer_threads: 4,
            write_cache_timeout: Duration::from_secs(30),
            read_cache_lines: 32,
            container_lock_stripes: 64,
            has_superblock: true,
            compress: true,
            meta_index_pages: 256,
            file_mode: 0o640,
        }
    }
}

/// Commit state of a container id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitState {
    InWriteCache,
    InCommit,
    Committed,
    WillNeverCommit,
    Unknown,
}

/// Result of checking every container id a block mapping references.
#[derive(Clone, Debug)]
pub struct StorageCommitCheck {
    pub open: Vec<u64>,
    pub never_committed: Vec<u64>,
}

impl StorageCommitCheck {
    pub fn all_committed(&self) -> bool {
        self.open.is_empty() && self.never_committed.is_empty()
    }
}

/// Notifications feeding the garbage collector's candidate map.
#[derive(Clone, Debug)]
pub enum GcNotification {
    Committed {
        container_id: u64,
        active_data_size: u64,
        item_count: u32,
    },
    Merged {
        new_primary_id: u64,
        old_ids: Vec<u64>,
        active_data_size: u64,
        item_count: u32,
    },
    Moved {
        container_id: u64,
        active_data_size: u64,
        item_count: u32,
    },
    Deleted {
        container_id: u64,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct StorageHeaderRecord {
    last_given_container_id: u64,
    container_size: u64,
    file_count: u16,
    slots_per_file: u64,
    has_superblock: bool,
    uuid: String,
}

#[derive(Default)]
pub struct ContainerStorageStats {
    pub committed: AtomicU64,
    pub commit_failures: AtomicU64,
    pub merges: AtomicU64,
    pub moves: AtomicU64,
    pub deletes: AtomicU64,
    pub merge_aborts: AtomicU64,
    pub handovers: AtomicU64,
    pub timeouts: AtomicU64,
}

struct ContainerFileHandle {
    file: File,
    // guards positional I/O on this container file
    lock: Mutex<()>,
}

struct CommitTracking {
    pending: u64,
}

/// The container storage.
///
/// Owns the container files, the meta-data index (container id → address),
/// the write and read caches, the allocator and the background committer
/// pool. All mutations are sequenced through the operations log; this type
/// is also a log consumer applying container events to its own state.
pub struct ContainerStorage {
    config: ContainerStorageConfig,
    files: Vec<ContainerFileHandle>,
    info: Arc<InfoStore>,
    oplog: Arc<OpLog>,

    // container_id -> ContainerAddress, guarded by `meta_lock`
    meta_index: DiskHashIndex,
    meta_lock: RwLock<()>,

    commit_states: Mutex<HashMap<u64, CommitState>>,
    // (file_index, slot) of opened-but-uncommitted containers
    opened_addresses: Mutex<HashMap<u64, (u16, u64)>>,

    allocator: Mutex<ContainerAllocator>,
    write_cache: ContainerWriteCache,
    read_cache: ContainerReadCache,
    container_locks: RwLockStripes,
    in_move_set: Mutex<HashSet<u64>>,
    // containers currently being written by the committer
    in_flight: Mutex<HashMap<u64, Arc<Container>>>,

    last_given_id: AtomicU64,
    highest_committed_id: AtomicU64,
    uuid: String,

    committer_tx: Mutex<Option<Sender<OpenContainer>>>,
    committer_handles: Mutex<Vec<std::thread::JoinHandle<()>>>,
    commit_tracking: Mutex<CommitTracking>,
    committer_idle: Condvar,
    shutdown: Arc<AtomicBool>,

    gc_notifier: Mutex<Option<Sender<GcNotification>>>,
    pub stats: ContainerStorageStats,
}

fn encode_address(address: &ContainerAddress) -> [u8; META_VALUE_SIZE] {
    let mut value = [0u8; META_VALUE_SIZE];
    match address {
        ContainerAddress::Primary {
            file_index,
            file_offset,
            log_id,
        } => {
            value[0] = 1;
            value[1..3].copy_from_slice(&file_index.to_le_bytes());
            value[3..11].copy_from_slice(&file_offset.to_le_bytes());
            value[11..19].copy_from_slice(&log_id.to_le_bytes());
        }
        ContainerAddress::Redirect { primary_id, log_id } => {
            value[0] = 2;
            value[3..11].copy_from_slice(&primary_id.to_le_bytes());
            value[11..19].copy_from_slice(&log_id.to_le_bytes());
        }
    }
    value
}

fn decode_address(value: &[u8]) -> Result<ContainerAddress, Error> {
    if value.len() != META_VALUE_SIZE {
        bail!("meta-data entry has invalid size {}", value.len());
    }
    let log_id = u64::from_le_bytes(value[11..19].try_into().unwrap());
    match value[0] {
        1 => Ok(ContainerAddress::Primary {
            file_index: u16::from_le_bytes(value[1..3].try_into().unwrap()),
            file_offset: u64::from_le_bytes(value[3..11].try_into().unwrap()),
            log_id,
        }),
        2 => Ok(ContainerAddress::Redirect {
            primary_id: u64::from_le_bytes(value[3..11].try_into().unwrap()),
            log_id,
        }),
        tag => bail!("meta-data entry has invalid tag {tag}"),
    }
}

fn generate_uuid() -> Result<String, Error> {
    let mut raw = [0u8; 16];
    let file = File::open("/dev/urandom")?;
    file.read_exact_at(&mut raw, 0)?;
    raw[6] = (raw[6] & 0x0f) | 0x40;
    raw[8] = (raw[8] & 0x3f) | 0x80;
    let hex = hex::encode(raw);
    Ok(format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    ))
}

impl ContainerStorage {
    fn container_file_path(base: &Path, file_index: u16) -> PathBuf {
        base.join(format!("container-{file_index:03}.data"))
    }

    fn meta_index_path(base: &Path) -> PathBuf {
        base.join("meta-index.dhi")
    }

    /// Create or open the storage under `base` and start the committer
    /// pool and the write-cache timeout scanner.
    pub fn start(
        base: &Path,
        config: ContainerStorageConfig,
        ctx: &StartContext,
        info: Arc<InfoStore>,
        oplog: Arc<OpLog>,
    ) -> Result<Arc<Self>, Error> {
        let superblock_size = if config.has_superblock {
            SUPERBLOCK_SIZE
        } else {
            0
        };
        let file_size = superblock_size + config.slots_per_file * config.container_size as u64;

        let (uuid, last_given_id) = if ctx.is_create() {
            let uuid = generate_uuid()?;
            let record = StorageHeaderRecord {
                last_given_container_id: 0,
                container_size: config.container_size as u64,
                file_count: config.file_count,
                slots_per_file: config.slots_per_file,
                has_superblock: config.has_superblock,
                uuid: uuid.clone(),
            };
            info.set(STORAGE_HEADER_KEY, &record)?;
            (uuid, 0)
        } else {
            let record: StorageHeaderRecord = info
                .get(STORAGE_HEADER_KEY)?
                .ok_or_else(|| format_err!("container storage header missing"))?;
            if record.container_size != config.container_size as u64
                || record.file_count != config.file_count
                || record.slots_per_file != config.slots_per_file
            {
                bail!("container storage geometry does not match the configuration");
            }
            (record.uuid, record.last_given_container_id)
        };

        let mut files = Vec::new();
        for file_index in 0..config.file_count {
            let path = Self::container_file_path(base, file_index);
            let file = if ctx.is_create() {
                let file = open_file(
                    &path,
                    OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL,
                    config.file_mode,
                )?;
                nix::unistd::ftruncate(
                    std::os::unix::io::AsRawFd::as_raw_fd(&file),
                    file_size as i64,
                )?;
                if config.has_superblock {
                    let mut superblock = vec![0u8; SUPERBLOCK_SIZE as usize];
                    superblock[0..8].copy_from_slice(&SUPERBLOCK_MAGIC_1_0);
                    superblock[8..8 + uuid.len()].copy_from_slice(uuid.as_bytes());
                    file.write_all_at(&superblock, 0)?;
                }
                file
            } else {
                let file = open_file(&path, OFlag::O_RDWR, config.file_mode)?;
                if config.has_superblock {
                    let mut superblock = vec![0u8; SUPERBLOCK_SIZE as usize];
                    file.read_exact_at(&mut superblock, 0)?;
                    if superblock[0..8] != SUPERBLOCK_MAGIC_1_0 {
                        bail!("container file {path:?} has unknown superblock magic");
                    }
                    if &superblock[8..8 + uuid.len()] != uuid.as_bytes() {
                        bail!("container file {path:?} belongs to another store");
                    }
                }
                file
            };
            files.push(ContainerFileHandle {
                file,
                lock: Mutex::new(()),
            });
        }

        let meta_path = Self::meta_index_path(base);
        let meta_index = if ctx.is_create() {
            DiskHashIndex::create(
                &meta_path,
                DiskHashConfig {
                    file_mode: config.file_mode,
                    ..DiskHashConfig::new(config.meta_index_pages, 8, META_VALUE_SIZE)
                },
            )?
        } else {
            DiskHashIndex::open(&meta_path, 64)?
        };

        let storage = Arc::new(Self {
            allocator: Mutex::new(ContainerAllocator::new(
                config.file_count,
                config.slots_per_file,
            )),
            write_cache: ContainerWriteCache::new(config.write_cache_slots),
            read_cache: ContainerReadCache::new(config.read_cache_lines),
            container_locks: rwlock_stripes(config.container_lock_stripes),
            in_move_set: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashMap::new()),
            commit_states: Mutex::new(HashMap::new()),
            opened_addresses: Mutex::new(HashMap::new()),
            last_given_id: AtomicU64::new(last_given_id),
            highest_committed_id: AtomicU64::new(0),
            uuid,
            committer_tx: Mutex::new(None),
            committer_handles: Mutex::new(Vec::new()),
            commit_tracking: Mutex::new(CommitTracking { pending: 0 }),
            committer_idle: Condvar::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            gc_notifier: Mutex::new(None),
            stats: ContainerStorageStats::default(),
            config,
            files,
            info,
            oplog,
            meta_index,
            meta_lock: RwLock::new(()),
        });

        storage.rebuild_allocator()?;
        storage.spawn_workers();
        Ok(storage)
    }

    /// Mark every slot referenced by a primary meta-data entry as used.
    fn rebuild_allocator(&self) -> Result<(), Error> {
        let _guard = self.meta_lock.read().unwrap();
        let mut allocator = self.allocator.lock().unwrap();
        let mut highest = 0u64;
        self.meta_index.iterate(|key, value| {
            let id = u64::from_le_bytes(key.try_into().unwrap());
            highest = highest.max(id);
            if let ContainerAddress::Primary {
                file_index,
                file_offset,
                ..
            } = decode_address(value)?
            {
                allocator.mark_used(file_index, self.slot_of(file_offset))?;
            }
            Ok(())
        })?;
        self.highest_committed_id.store(highest, Ordering::SeqCst);
        Ok(())
    }

    fn spawn_workers(self: &Arc<Self>) {
        let (tx, rx) = bounded::<OpenContainer>(self.config.write_cache_slots * 2);
        *self.committer_tx.lock().unwrap() = Some(tx);

        let mut handles = self.committer_handles.lock().unwrap();
        for worker in 0..self.config.committer_threads.max(1) {
            let storage = Arc::clone(self);
            let rx: Receiver<OpenContainer> = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("container-commit-{worker}"))
                .spawn(move || {
                    while let Ok(open) = rx.recv() {
                        storage.commit_container(open);
                    }
                })
                .expect("unable to spawn committer");
            handles.push(handle);
        }

        let storage = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("container-timeout".to_string())
            .spawn(move || {
                while !storage.shutdown.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(500));
                    let expired = storage
                        .write_cache
                        .take_expired(storage.config.write_cache_timeout);
                    for open in expired {
                        storage.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                        storage.send_to_committer(open);
                    }
                }
            })
            .expect("unable to spawn timeout scanner");
        handles.push(handle);
    }

    pub fn set_gc_notifier(&self, sender: Sender<GcNotification>) {
        *self.gc_notifier.lock().unwrap() = Some(sender);
    }

    fn notify_gc(&self, notification: GcNotification) {
        if let Some(sender) = self.gc_notifier.lock().unwrap().as_ref() {
            let _ = sender.try_send(notification);
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn container_size(&self) -> usize {
        self.config.container_size
    }

    pub fn last_given_container_id(&self) -> u64 {
        self.last_given_id.load(Ordering::SeqCst)
    }

    pub fn highest_committed_container_id(&self) -> u64 {
        self.highest_committed_id.load(Ordering::SeqCst)
    }

    pub fn free_slots(&self) -> u64 {
        self.allocator.lock().unwrap().free_slots()
    }

    fn superblock_offset(&self) -> u64 {
        if self.config.has_superblock {
            SUPERBLOCK_SIZE
        } else {
            0
        }
    }

    fn offset_of(&self, slot: u64) -> u64 {
        self.superblock_offset() + slot * self.config.container_size as u64
    }

    fn slot_of(&self, file_offset: u64) -> u64 {
        (file_offset - self.superblock_offset()) / self.config.container_size as u64
    }

    fn send_to_committer(&self, open: OpenContainer) {
        {
            let mut tracking = self.commit_tracking.lock().unwrap();
            tracking.pending += 1;
        }
        let sender = self.committer_tx.lock().unwrap().clone();
        match sender {
            Some(sender) => {
                if sender.send(open).is_err() {
                    log::error!("committer pool is gone, dropping open container");
                    self.commit_finished();
                }
            }
            None => {
                log::error!("committer pool not running, dropping open container");
                self.commit_finished();
            }
        }
    }

    fn commit_finished(&self) {
        let mut tracking = self.commit_tracking.lock().unwrap();
        tracking.pending -= 1;
        if tracking.pending == 0 {
            self.committer_idle.notify_all();
        }
    }

    /// Block until every handed-over container is committed (or failed).
    pub fn wait_committer_idle(&self) {
        let mut tracking = self.commit_tracking.lock().unwrap();
        while tracking.pending > 0 {
            tracking = self.committer_idle.wait(tracking).unwrap();
        }
    }

    /// Reserve the next container id and a free slot, announce the open
    /// container in the log and return it.
    fn open_new_container(&self, ec: &mut ErrorContext) -> Result<OpenContainer, Error> {
        let id = self.last_given_id.fetch_add(1, Ordering::SeqCst) + 1;

        // the id counter only ever moves forward, even across restarts
        let record = StorageHeaderRecord {
            last_given_container_id: id,
            container_size: self.config.container_size as u64,
            file_count: self.config.file_count,
            slots_per_file: self.config.slots_per_file,
            has_superblock: self.config.has_superblock,
            uuid: self.uuid.clone(),
        };
        self.info.set(STORAGE_HEADER_KEY, &record)?;

        let (file_index, slot) = match self.allocator.lock().unwrap().allocate() {
            Some(coords) => coords,
            None => {
                ec.set(ErrorFlags::FULL);
                bail!("no free container slot left");
            }
        };

        let address = ContainerAddress::Primary {
            file_index,
            file_offset: self.offset_of(slot),
            log_id: 0,
        };
        self.oplog.commit_event(
            &Event::ContainerOpened {
                container_id: id,
                address,
            },
            ec,
        )?;

        Ok(OpenContainer {
            container: Container::new(id, self.config.container_size),
            file_index,
            slot,
            opened_at: Instant::now(),
        })
    }

    /// Place a chunk payload into an open container, opening or handing
    /// over containers as needed. Returns the container id the chunk went
    /// to. The caller is responsible for the chunk index entry.
    pub fn add_chunk(
        &self,
        key: Fingerprint,
        payload: &[u8],
        is_indexed: bool,
        ec: &mut ErrorContext,
    ) -> Result<u64, Error> {
        if payload.len() + 1024 > self.config.container_size {
            ec.set(ErrorFlags::FULL);
            bail!("chunk of {} bytes exceeds the container size", payload.len());
        }

        loop {
            if let Some(id) = self.write_cache.append_to_fitting(key, payload, is_indexed) {
                return Ok(id);
            }

            if let Some(open) = self.write_cache.take_handover_candidate() {
                self.stats.handovers.fetch_add(1, Ordering::Relaxed);
                self.send_to_committer(open);
            }

            let open = self.open_new_container(ec)?;
            match self
                .write_cache
                .install_and_append(open, key, payload, is_indexed)
            {
                Ok(id) => return Ok(id),
                Err(open) => {
                    // raced against other writers; hand the fresh container
                    // back through the regular fill path
                    let id = open.container.primary_id();
                    log::debug!("write cache contended, re-queueing container {id}");
                    self.send_to_committer(open);
                }
            }
        }
    }

    /// Serialize and write a container, then announce the outcome.
    fn commit_container(&self, open: OpenContainer) {
        let id = open.container.primary_id();
        let mut ec = ErrorContext::new();

        if open.container.is_empty() {
            // nothing was ever stored; treat like a failed commit so the
            // slot is reclaimed
            let _ = self.oplog.commit_event(
                &Event::ContainerCommitFailed {
                    container_id: id,
                    item_keys: Vec::new(),
                },
                &mut ec,
            );
            self.commit_finished();
            return;
        }

        let container = Arc::new(open.container);
        self.in_flight.lock().unwrap().insert(id, container.clone());
        self.commit_states
            .lock()
            .unwrap()
            .insert(id, CommitState::InCommit);

        let result = self.write_container(&container, open.file_index, open.slot);
        match result {
            Ok(()) => {
                let address = ContainerAddress::Primary {
                    file_index: open.file_index,
                    file_offset: self.offset_of(open.slot),
                    log_id: 0,
                };
                let event = Event::ContainerCommitted {
                    container_id: id,
                    address,
                    item_count: container.item_count() as u32,
                    active_data_size: container.active_data_size(),
                };
                if self.oplog.commit_event(&event, &mut ec).is_ok() {
                    self.stats.committed.fetch_add(1, Ordering::Relaxed);
                } else {
                    log::error!("container {id}: commit event failed");
                }
            }
            Err(err) => {
                log::error!("container {id}: write failed - {err:#}");
                self.stats.commit_failures.fetch_add(1, Ordering::Relaxed);
                let item_keys = container.items().iter().map(|item| item.key).collect();
                let _ = self.oplog.commit_event(
                    &Event::ContainerCommitFailed {
                        container_id: id,
                        item_keys,
                    },
                    &mut ec,
                );
            }
        }
        self.commit_finished();
    }

    fn write_container(&self, container: &Container, file_index: u16, slot: u64) -> Result<(), Error> {
        let data = container.serialize(self.config.compress)?;
        let handle = &self.files[file_index as usize];
        let _guard = handle.lock.lock().unwrap();
        handle.file.write_all_at(&data, self.offset_of(slot))?;
        dbs_tools::fs::datasync(&handle.file)?;
        Ok(())
    }

    fn read_container_blob(&self, file_index: u16, file_offset: u64) -> Result<Vec<u8>, Error> {
        let handle = self
            .files
            .get(file_index as usize)
            .ok_or_else(|| format_err!("container file index {file_index} out of range"))?;
        let mut data = vec![0u8; self.config.container_size];
        let _guard = handle.lock.lock().unwrap();
        handle.file.read_exact_at(&mut data, file_offset)?;
        Ok(data)
    }

    /// Resolve an id to its primary id and file coordinates, following at
    /// most one redirection hop.
    pub fn resolve_address(&self, id: u64) -> Result<Option<(u64, u16, u64)>, Error> {
        let _guard = self.meta_lock.read().unwrap();
        let value = match self.meta_index.get(&id.to_le_bytes())? {
            Some(value) => value,
            None => return Ok(None),
        };
        match decode_address(&value)? {
            ContainerAddress::Primary {
                file_index,
                file_offset,
                ..
            } => Ok(Some((id, file_index, file_offset))),
            ContainerAddress::Redirect { primary_id, .. } => {
                let value = self
                    .meta_index
                    .get(&primary_id.to_le_bytes())?
                    .ok_or_else(|| {
                        format_err!("redirection {id} -> {primary_id} points nowhere")
                    })?;
                match decode_address(&value)? {
                    ContainerAddress::Primary {
                        file_index,
                        file_offset,
                        ..
                    } => Ok(Some((primary_id, file_index, file_offset))),
                    ContainerAddress::Redirect { .. } => bail!(
                        "container {id}: more than one redirection hop via {primary_id}"
                    ),
                }
            }
        }
    }

    /// Visit every primary container id in the meta-data index.
    pub fn for_each_primary_container(
        &self,
        mut callback: impl FnMut(u64) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let mut ids = Vec::new();
        {
            let _guard = self.meta_lock.read().unwrap();
            self.meta_index.iterate(|key, value| {
                if decode_address(value)?.is_primary() {
                    ids.push(u64::from_le_bytes(key.try_into().unwrap()));
                }
                Ok(())
            })?;
        }
        for id in ids {
            callback(id)?;
        }
        Ok(())
    }

    pub fn lookup_address(&self, id: u64) -> Result<Option<ContainerAddress>, Error> {
        let _guard = self.meta_lock.read().unwrap();
        match self.meta_index.get(&id.to_le_bytes())? {
            Some(value) => Ok(Some(decode_address(&value)?)),
            None => Ok(None),
        }
    }

    /// Read a committed container through the read cache.
    ///
    /// Holds the container read locks of the requested id and its primary
    /// while touching the address, so a concurrent merge cannot free the
    /// slot mid-read.
    pub fn read_container(&self, id: u64, ec: &mut ErrorContext) -> Result<Arc<Container>, Error> {
        for _attempt in 0..5 {
            let (primary_id, file_index, file_offset) = match self.resolve_address(id)? {
                Some(resolved) => resolved,
                None => {
                    ec.set(ErrorFlags::NOT_FOUND);
                    bail!("container {id} has no address");
                }
            };

            if let Some(container) = self.read_cache.get(primary_id) {
                return Ok(container);
            }
            if let Some(container) = self.in_flight.lock().unwrap().get(&primary_id) {
                return Ok(container.clone());
            }

            // read locks in ascending stripe order, then re-check that the
            // resolution still holds
            let mut stripes = vec![
                self.container_locks.stripe_index(id),
                self.container_locks.stripe_index(primary_id),
            ];
            stripes.sort_unstable();
            stripes.dedup();
            let _guards: Vec<_> = stripes
                .iter()
                .map(|stripe| self.container_locks.stripe(*stripe as u64).read().unwrap())
                .collect();

            match self.resolve_address(id)? {
                Some(resolved) if resolved == (primary_id, file_index, file_offset) => {}
                _ => continue, // merged or moved between the two lookups
            }

            let data = self.read_container_blob(file_index, file_offset).map_err(|err| {
                ec.set(ErrorFlags::IO);
                err
            })?;
            let container =
                Container::deserialize_checked(&data, self.config.container_size, primary_id)
                    .map_err(|err| {
                        ec.set(ErrorFlags::INTEGRITY);
                        err
                    })?;
            let container = Arc::new(container);
            self.read_cache.insert(primary_id, container.clone());
            return Ok(container);
        }
        ec.set(ErrorFlags::ABORTED);
        bail!("container {id} kept moving, read aborted");
    }

    /// Read a chunk payload by (container id, fingerprint).
    ///
    /// Serves from the write cache and the committer's in-flight set before
    /// touching disk, so chunks are readable the moment they are placed.
    pub fn read_chunk(
        &self,
        container_id: u64,
        key: &Fingerprint,
        ec: &mut ErrorContext,
    ) -> Result<Option<Vec<u8>>, Error> {
        if let Some(payload) = self.write_cache.find_chunk(container_id, key) {
            return Ok(Some(payload));
        }
        if let Some(container) = self.in_flight.lock().unwrap().get(&container_id) {
            return Ok(container.find_item(key).map(|item| item.payload().to_vec()));
        }
        if self.commit_states.lock().unwrap().get(&container_id)
            == Some(&CommitState::WillNeverCommit)
        {
            return Ok(None);
        }
        if self.resolve_address(container_id)?.is_none() {
            // between the write cache and the meta-data entry there is a
            // short in-commit window; retry before reporting a miss
            for _ in 0..50 {
                if let Some(payload) = self.write_cache.find_chunk(container_id, key) {
                    return Ok(Some(payload));
                }
                if let Some(container) = self.in_flight.lock().unwrap().get(&container_id) {
                    return Ok(container.find_item(key).map(|item| item.payload().to_vec()));
                }
                if self.resolve_address(container_id)?.is_some() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            if self.resolve_address(container_id)?.is_none() {
                return Ok(None);
            }
        }
        let container = self.read_container(container_id, ec)?;
        Ok(container.find_item(key).map(|item| item.payload().to_vec()))
    }

    /// Commit state of a container id.
    pub fn commit_state(&self, id: u64) -> CommitState {
        if self.write_cache.contains_id(id) {
            return CommitState::InWriteCache;
        }
        if self.in_flight.lock().unwrap().contains_key(&id) {
            return CommitState::InCommit;
        }
        if let Some(state) = self.commit_states.lock().unwrap().get(&id) {
            if *state == CommitState::WillNeverCommit {
                return CommitState::WillNeverCommit;
            }
        }
        match self.lookup_address(id) {
            Ok(Some(_)) => CommitState::Committed,
            Ok(None) => match self.commit_states.lock().unwrap().get(&id) {
                Some(state) => *state,
                None => CommitState::Unknown,
            },
            Err(_) => CommitState::Unknown,
        }
    }

    /// Check every container id a block mapping references.
    pub fn block_mapping_storage_check(
        &self,
        ids: impl IntoIterator<Item = u64>,
    ) -> StorageCommitCheck {
        let mut check = StorageCommitCheck {
            open: Vec::new(),
            never_committed: Vec::new(),
        };
        for id in ids {
            match self.commit_state(id) {
                CommitState::Committed => {}
                CommitState::WillNeverCommit | CommitState::Unknown => {
                    check.never_committed.push(id)
                }
                CommitState::InWriteCache | CommitState::InCommit => check.open.push(id),
            }
        }
        check
    }

    /// Hand over every non-empty open container to the committer.
    pub fn commit_open_containers(&self) {
        for open in self.write_cache.take_all_nonempty() {
            self.send_to_committer(open);
        }
    }

    /// Drop open containers without committing them (forced stop).
    pub fn drop_open_containers(&self) {
        let dropped = self.write_cache.drop_all();
        if !dropped.is_empty() {
            log::warn!("dropping {} open containers", dropped.len());
        }
    }

    pub fn flush_meta_index(&self) -> Result<(), Error> {
        let _guard = self.meta_lock.read().unwrap();
        self.meta_index.flush()
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wait_committer_idle();
        *self.committer_tx.lock().unwrap() = None;
        let handles: Vec<_> = self.committer_handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                log::error!("container storage worker panicked");
            }
        }
    }

    fn install_meta_entry(&self, id: u64, address: ContainerAddress) -> Result<(), Error> {
        let _guard = self.meta_lock.write().unwrap();
        if let Some(existing) = self.meta_index.get(&id.to_le_bytes())? {
            // later moves/merges carry higher log ids and win on replay
            if decode_address(&existing)?.log_id() >= address.log_id() {
                return Ok(());
            }
        }
        self.meta_index.put(&id.to_le_bytes(), &encode_address(&address))
    }

    fn remove_meta_entry(&self, id: u64) -> Result<(bool, Option<ContainerAddress>), Error> {
        let _guard = self.meta_lock.write().unwrap();
        let old = match self.meta_index.get(&id.to_le_bytes())? {
            Some(value) => Some(decode_address(&value)?),
            None => None,
        };
        let removed = self.meta_index.delete(&id.to_le_bytes())?;
        Ok((removed, old))
    }

    fn free_primary_slot(&self, address: &ContainerAddress) -> Result<(), Error> {
        if let ContainerAddress::Primary {
            file_index,
            file_offset,
            ..
        } = address
        {
            self.allocator
                .lock()
                .unwrap()
                .mark_free(*file_index, self.slot_of(*file_offset))?;
        }
        Ok(())
    }

    // ---- log event application ----------------------------------------

    fn apply_container_opened(
        &self,
        container_id: u64,
        address: &ContainerAddress,
        context: &LogReplayContext,
    ) -> Result<(), Error> {
        if let ContainerAddress::Primary {
            file_index,
            file_offset,
            ..
        } = address
        {
            let slot = self.slot_of(*file_offset);
            self.allocator.lock().unwrap().mark_used(*file_index, slot)?;
            self.opened_addresses
                .lock()
                .unwrap()
                .insert(container_id, (*file_index, slot));
        }

        // replayed opens may exceed the persisted counter
        let mut last = self.last_given_id.load(Ordering::SeqCst);
        while last < container_id {
            match self.last_given_id.compare_exchange(
                last,
                container_id,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(current) => last = current,
            }
        }

        let mut states = self.commit_states.lock().unwrap();
        states.entry(container_id).or_insert(CommitState::InWriteCache);
        let _ = context;
        Ok(())
    }

    fn apply_container_committed(
        &self,
        container_id: u64,
        address: &ContainerAddress,
        active_data_size: u64,
        item_count: u32,
        context: &LogReplayContext,
    ) -> Result<(), Error> {
        self.install_meta_entry(container_id, address.with_log_id(context.log_id))?;

        if let ContainerAddress::Primary {
            file_index,
            file_offset,
            ..
        } = address
        {
            self.allocator
                .lock()
                .unwrap()
                .mark_used(*file_index, self.slot_of(*file_offset))?;
        }

        // the meta-data entry now answers commit-state queries
        self.commit_states.lock().unwrap().remove(&container_id);
        self.opened_addresses.lock().unwrap().remove(&container_id);

        let mut highest = self.highest_committed_id.load(Ordering::SeqCst);
        while highest < container_id {
            match self.highest_committed_id.compare_exchange(
                highest,
                container_id,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(current) => highest = current,
            }
        }

        // the committer thread is done with this container once the meta
        // entry is visible
        self.in_flight.lock().unwrap().remove(&container_id);

        self.notify_gc(GcNotification::Committed {
            container_id,
            active_data_size,
            item_count,
        });
        Ok(())
    }

    fn apply_container_commit_failed(
        &self,
        container_id: u64,
        _context: &LogReplayContext,
    ) -> Result<(), Error> {
        self.commit_states
            .lock()
            .unwrap()
            .insert(container_id, CommitState::WillNeverCommit);
        if let Some((file_index, slot)) =
            self.opened_addresses.lock().unwrap().remove(&container_id)
        {
            self.allocator.lock().unwrap().mark_free(file_index, slot)?;
        }
        self.in_flight.lock().unwrap().remove(&container_id);
        Ok(())
    }

    fn apply_container_merged(
        &self,
        event: &Event,
        context: &LogReplayContext,
    ) -> Result<(), Error> {
        let (new_primary_id, new_secondary_ids, new_address, unused_ids, item_count, active) =
            match event {
                Event::ContainerMerged {
                    new_primary_id,
                    new_secondary_ids,
                    new_address,
                    unused_ids,
                    new_item_count,
                    new_active_data_size,
                    ..
                } => (
                    *new_primary_id,
                    new_secondary_ids.clone(),
                    *new_address,
                    unused_ids.clone(),
                    *new_item_count,
                    *new_active_data_size,
                ),
                _ => unreachable!(),
            };

        let mut old_ids = vec![new_primary_id];
        old_ids.extend(new_secondary_ids.iter().copied());

        // free the two old primary slots before their entries disappear
        for id in new_secondary_ids.iter().chain(unused_ids.iter()) {
            let (_removed, old) = self.remove_meta_entry(*id)?;
            if let Some(old) = old {
                if old.log_id() >= context.log_id {
                    // a newer entry was already installed, put it back
                    self.install_meta_entry(*id, old)?;
                    continue;
                }
                self.free_primary_slot(&old)?;
            }
            self.read_cache.invalidate(*id);
        }
        {
            // the old primary entry of the surviving id is replaced, its
            // slot must be freed too
            let _guard = self.meta_lock.read().unwrap();
            if let Some(existing) = self.meta_index.get(&new_primary_id.to_le_bytes())? {
                let existing = decode_address(&existing)?;
                if existing.log_id() < context.log_id {
                    self.free_primary_slot(&existing)?;
                }
            }
        }

        self.install_meta_entry(new_primary_id, new_address.with_log_id(context.log_id))?;
        for id in &new_secondary_ids {
            self.install_meta_entry(
                *id,
                ContainerAddress::Redirect {
                    primary_id: new_primary_id,
                    log_id: context.log_id,
                },
            )?;
        }
        if let ContainerAddress::Primary {
            file_index,
            file_offset,
            ..
        } = new_address
        {
            self.allocator
                .lock()
                .unwrap()
                .mark_used(file_index, self.slot_of(file_offset))?;
        }
        self.read_cache.invalidate(new_primary_id);

        self.notify_gc(GcNotification::Merged {
            new_primary_id,
            old_ids,
            active_data_size: active,
            item_count,
        });
        Ok(())
    }

    fn apply_container_moved(
        &self,
        container_id: u64,
        old_address: &ContainerAddress,
        new_address: &ContainerAddress,
        item_count: u32,
        active_data_size: u64,
        context: &LogReplayContext,
    ) -> Result<(), Error> {
        if old_address.log_id() < context.log_id {
            self.free_primary_slot(old_address)?;
        }
        self.install_meta_entry(container_id, new_address.with_log_id(context.log_id))?;
        if let ContainerAddress::Primary {
            file_index,
            file_offset,
            ..
        } = new_address
        {
            self.allocator
                .lock()
                .unwrap()
                .mark_used(*file_index, self.slot_of(*file_offset))?;
        }
        self.read_cache.invalidate(container_id);
        self.notify_gc(GcNotification::Moved {
            container_id,
            active_data_size,
            item_count,
        });
        Ok(())
    }

    fn apply_container_deleted(
        &self,
        container_id: u64,
        secondary_container_ids: &[u64],
        _context: &LogReplayContext,
    ) -> Result<(), Error> {
        for id in std::iter::once(&container_id).chain(secondary_container_ids) {
            let (_removed, old) = self.remove_meta_entry(*id)?;
            if let Some(old) = old {
                self.free_primary_slot(&old)?;
            }
            self.read_cache.invalidate(*id);
            self.commit_states.lock().unwrap().remove(id);
        }
        self.notify_gc(GcNotification::Deleted { container_id });
        Ok(())
    }

    /// At the end of dirty start replay, every container that was opened
    /// but never committed can never commit anymore.
    fn finish_dirty_replay(&self) -> Result<(), Error> {
        let opened: Vec<(u64, (u16, u64))> = self
            .opened_addresses
            .lock()
            .unwrap()
            .drain()
            .collect();
        let mut states = self.commit_states.lock().unwrap();
        let mut allocator = self.allocator.lock().unwrap();
        for (id, (file_index, slot)) in opened {
            log::info!("container {id} was open at the crash, it will never commit");
            states.insert(id, CommitState::WillNeverCommit);
            allocator.mark_free(file_index, slot)?;
        }
        Ok(())
    }

    // ---- merge / move / delete ----------------------------------------

    fn lock_in_move(&self, ids: &[u64]) -> bool {
        let mut set = self.in_move_set.lock().unwrap();
        if ids.iter().any(|id| set.contains(id)) {
            return false;
        }
        for id in ids {
            set.insert(*id);
        }
        true
    }

    fn unlock_in_move(&self, ids: &[u64]) {
        let mut set = self.in_move_set.lock().unwrap();
        for id in ids {
            set.remove(id);
        }
    }

    fn force_read_primary(&self, id: u64) -> Result<Container, Error> {
        let (primary_id, file_index, file_offset) = self
            .resolve_address(id)?
            .ok_or_else(|| format_err!("container {id} has no address"))?;
        if primary_id != id {
            bail!("container {id} is not primary (redirects to {primary_id})");
        }
        let data = self.read_container_blob(file_index, file_offset)?;
        Container::deserialize_checked(&data, self.config.container_size, id)
    }

    /// Merge two committed containers into a fresh slot.
    ///
    /// Items failing `keep` are dropped and their keys returned for
    /// chunk-index cleanup. Contested locks abort (`Ok(None)`) instead of
    /// blocking; the caller retries later.
    pub fn try_merge_container(
        &self,
        id1: u64,
        id2: u64,
        keep: &mut dyn FnMut(&Fingerprint) -> bool,
        ec: &mut ErrorContext,
    ) -> Result<Option<(u64, Vec<Fingerprint>)>, Error> {
        if id1 == id2 {
            bail!("cannot merge container {id1} with itself");
        }

        // ascending stripe order, skipping duplicate stripes
        let mut stripe_order = vec![
            self.container_locks.stripe_index(id1),
            self.container_locks.stripe_index(id2),
        ];
        stripe_order.sort_unstable();
        stripe_order.dedup();

        let mut guards = Vec::new();
        for stripe in &stripe_order {
            match self.container_locks.stripe(*stripe as u64).try_write() {
                Ok(guard) => guards.push(guard),
                Err(_) => {
                    ec.set(ErrorFlags::ABORTED);
                    self.stats.merge_aborts.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
            }
        }

        let move_ids = [id1, id2];
        if !self.lock_in_move(&move_ids) {
            ec.set(ErrorFlags::ABORTED);
            self.stats.merge_aborts.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }
        let result = self.merge_locked(id1, id2, keep, ec);
        self.unlock_in_move(&move_ids);
        result
    }

    fn merge_locked(
        &self,
        id1: u64,
        id2: u64,
        keep: &mut dyn FnMut(&Fingerprint) -> bool,
        ec: &mut ErrorContext,
    ) -> Result<Option<(u64, Vec<Fingerprint>)>, Error> {
        let first = match self.force_read_primary(id1) {
            Ok(container) => container,
            Err(err) => {
                log::debug!("merge of {id1}+{id2} aborted - {err}");
                ec.set(ErrorFlags::ABORTED);
                return Ok(None);
            }
        };
        let second = match self.force_read_primary(id2) {
            Ok(container) => container,
            Err(err) => {
                log::debug!("merge of {id1}+{id2} aborted - {err}");
                ec.set(ErrorFlags::ABORTED);
                return Ok(None);
            }
        };

        let new_primary_id = id1.max(id2);
        let mut merged = Container::new(new_primary_id, self.config.container_size);
        for id in first.all_ids().into_iter().chain(second.all_ids()) {
            merged.add_secondary_id(id);
        }

        let mut dropped = Vec::new();
        dropped.extend(merged.absorb(&first, keep)?);
        dropped.extend(merged.absorb(&second, keep)?);

        let (file_index, slot) = match self.allocator.lock().unwrap().allocate() {
            Some(coords) => coords,
            None => {
                ec.set(ErrorFlags::FULL);
                bail!("no free container slot for merge of {id1}+{id2}");
            }
        };

        if let Err(err) = self.write_container(&merged, file_index, slot) {
            self.allocator.lock().unwrap().mark_free(file_index, slot)?;
            ec.set(ErrorFlags::IO);
            return Err(err);
        }

        let new_secondary_ids: Vec<u64> = merged.secondary_ids().iter().copied().collect();
        let event = Event::ContainerMerged {
            first_id: id1,
            second_id: id2,
            first_secondary_ids: first.secondary_ids().iter().copied().collect(),
            second_secondary_ids: second.secondary_ids().iter().copied().collect(),
            new_primary_id,
            new_secondary_ids,
            new_address: ContainerAddress::Primary {
                file_index,
                file_offset: self.offset_of(slot),
                log_id: 0,
            },
            unused_ids: Vec::new(),
            new_item_count: merged.item_count() as u32,
            new_active_data_size: merged.active_data_size(),
        };

        // the direct dispatch runs on this thread, while the container
        // locks are held, so no reader can observe the freed slots
        self.oplog.commit_event(&event, ec)?;
        self.stats.merges.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "merged containers {id1}+{id2} into {new_primary_id} ({} items)",
            merged.active_item_count()
        );
        Ok(Some((new_primary_id, dropped)))
    }

    /// Rewrite a single container into a fresh slot, dropping garbage
    /// items. Used by the GC to compact containers with many dead items.
    pub fn try_move_container(
        &self,
        id: u64,
        keep: &mut dyn FnMut(&Fingerprint) -> bool,
        ec: &mut ErrorContext,
    ) -> Result<Option<Vec<Fingerprint>>, Error> {
        let guard = match self.container_locks.stripe(id).try_write() {
            Ok(guard) => guard,
            Err(_) => {
                ec.set(ErrorFlags::ABORTED);
                return Ok(None);
            }
        };
        if !self.lock_in_move(&[id]) {
            ec.set(ErrorFlags::ABORTED);
            return Ok(None);
        }

        let result = (|| {
            let old = match self.force_read_primary(id) {
                Ok(container) => container,
                Err(_) => {
                    ec.set(ErrorFlags::ABORTED);
                    return Ok(None);
                }
            };
            let old_address = self
                .lookup_address(id)?
                .ok_or_else(|| format_err!("container {id} lost its address"))?;

            let mut moved = Container::new(id, self.config.container_size);
            for secondary in old.secondary_ids() {
                moved.add_secondary_id(*secondary);
            }
            let dropped = moved.absorb(&old, keep)?;

            let (file_index, slot) = match self.allocator.lock().unwrap().allocate() {
                Some(coords) => coords,
                None => {
                    ec.set(ErrorFlags::FULL);
                    bail!("no free container slot for moving {id}");
                }
            };
            if let Err(err) = self.write_container(&moved, file_index, slot) {
                self.allocator.lock().unwrap().mark_free(file_index, slot)?;
                ec.set(ErrorFlags::IO);
                return Err(err);
            }

            let event = Event::ContainerMoved {
                container_id: id,
                old_address,
                new_address: ContainerAddress::Primary {
                    file_index,
                    file_offset: self.offset_of(slot),
                    log_id: 0,
                },
                old_item_count: old.item_count() as u32,
                item_count: moved.item_count() as u32,
                old_active_data_size: old.active_data_size(),
                active_data_size: moved.active_data_size(),
            };
            self.oplog.commit_event(&event, ec)?;
            self.stats.moves.fetch_add(1, Ordering::Relaxed);
            Ok(Some(dropped))
        })();

        self.unlock_in_move(&[id]);
        drop(guard);
        result
    }

    /// Delete a container that has no live items left.
    pub fn try_delete_container(
        &self,
        id: u64,
        ec: &mut ErrorContext,
    ) -> Result<bool, Error> {
        let guard = match self.container_locks.stripe(id).try_write() {
            Ok(guard) => guard,
            Err(_) => {
                ec.set(ErrorFlags::ABORTED);
                return Ok(false);
            }
        };
        if !self.lock_in_move(&[id]) {
            ec.set(ErrorFlags::ABORTED);
            return Ok(false);
        }

        let result = (|| {
            let container = match self.force_read_primary(id) {
                Ok(container) => container,
                Err(_) => {
                    ec.set(ErrorFlags::ABORTED);
                    return Ok(false);
                }
            };
            if container.active_item_count() != 0 {
                ec.set(ErrorFlags::ABORTED);
                return Ok(false);
            }
            let address = self
                .lookup_address(id)?
                .ok_or_else(|| format_err!("container {id} lost its address"))?;

            let event = Event::ContainerDeleted {
                container_id: id,
                secondary_container_ids: container.secondary_ids().iter().copied().collect(),
                address,
            };
            self.oplog.commit_event(&event, ec)?;
            self.stats.deletes.fetch_add(1, Ordering::Relaxed);
            log::info!("deleted empty container {id}");
            Ok(true)
        })();

        self.unlock_in_move(&[id]);
        drop(guard);
        result
    }
}

impl LogConsumer for ContainerStorage {
    fn name(&self) -> &'static str {
        "container-storage"
    }

    fn apply(&self, event: &Event, context: &LogReplayContext) -> Result<(), Error> {
        // all durable state is maintained at direct dispatch (and rebuilt
        // during dirty start); background replay has nothing left to do
        if context.mode == ReplayMode::Background {
            return Ok(());
        }

        match event {
            Event::ContainerOpened {
                container_id,
                address,
            } => self.apply_container_opened(*container_id, address, context),
            Event::ContainerCommitted {
                container_id,
                address,
                item_count,
                active_data_size,
            } => self.apply_container_committed(
                *container_id,
                address,
                *active_data_size,
                *item_count,
                context,
            ),
            Event::ContainerCommitFailed { container_id, .. } => {
                self.apply_container_commit_failed(*container_id, context)
            }
            Event::ContainerMerged { .. } => self.apply_container_merged(event, context),
            Event::ContainerMoved {
                container_id,
                old_address,
                new_address,
                item_count,
                active_data_size,
                ..
            } => self.apply_container_moved(
                *container_id,
                old_address,
                new_address,
                *item_count,
                *active_data_size,
                context,
            ),
            Event::ContainerDeleted {
                container_id,
                secondary_container_ids,
                ..
            } => self.apply_container_deleted(*container_id, secondary_container_ids, context),
            Event::ReplayStopped {
                replay_type: ReplayMode::DirtyStart,
                success: true,
            } => self.finish_dirty_replay(),
            _ => Ok(()),
        }
    }
}
