use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};

use dbs_api_types::{
    BlockMapping, BlockMappingItem, ChunkMapping, CreateMode, DirtyMode, ErrorContext,
    ErrorFlags, Fingerprint, ForceMode, LookupResult, StartContext, StopMode, SystemState,
};
use dbs_block_index::{BlockImporter, BlockIndex, BlockReadSource};
use dbs_chunk_index::{
    ChunkImporter, ChunkIndex, FullSamplingStrategy, SamplingStrategy, SuffixSamplingStrategy,
};
use dbs_container::{ContainerGc, ContainerStorage};
use dbs_index::InfoStore;
use dbs_oplog::{run_dirty_start_replay, BackgroundReplay, OpLog};

use crate::config::EngineConfig;

const ENGINE_STATE_KEY: &str = "engine-state";
const ENGINE_GEOMETRY_KEY: &str = "engine-geometry";
const STATISTICS_KEY: &str = "statistics";

#[derive(Debug, Serialize, Deserialize)]
struct EngineStateRecord {
    clean_shutdown: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct GeometryRecord {
    block_size: u32,
    fingerprint_size: usize,
    container_size: usize,
    container_file_count: u16,
    container_slots_per_file: u64,
}

/// Persisted counter snapshot, written at shutdown and on demand.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub containers_committed: u64,
    pub container_commit_failures: u64,
    pub container_merges: u64,
    pub container_moves: u64,
    pub container_deletes: u64,
    pub chunk_index_hits: u64,
    pub chunk_index_misses: u64,
    pub chunk_index_puts: u64,
    pub chunk_imports: u64,
    pub blocks_stored: u64,
    pub blocks_deleted: u64,
    pub blocks_imported: u64,
    pub block_write_failures: u64,
}

/// The deduplicating block storage engine.
///
/// Owns the operations log, the container storage, the chunk index and the
/// block index, wires them up as log consumers and runs the background
/// workers. The front-end drives it with `write_block` / `read_block` /
/// `delete_block` streams of (fingerprint, payload) chunks produced by the
/// external chunking pipeline.
pub struct Engine {
    config: EngineConfig,
    base: PathBuf,
    _lock: File,
    info: Arc<InfoStore>,
    oplog: Arc<OpLog>,
    storage: Arc<ContainerStorage>,
    chunk_index: Arc<ChunkIndex>,
    block_index: Arc<BlockIndex>,
    gc: Arc<ContainerGc>,
    chunk_importer: Mutex<Option<ChunkImporter>>,
    block_importer: Mutex<Option<BlockImporter>>,
    background_replay: Mutex<Option<BackgroundReplay>>,
    state: Mutex<SystemState>,
    readonly: bool,
}

impl Engine {
    /// Format a new engine directory.
    pub fn create<P: AsRef<Path>>(base: P, config: EngineConfig) -> Result<Arc<Self>, Error> {
        let mut ctx = StartContext::create();
        ctx.file_mode = config.file_mode;
        ctx.dir_mode = config.dir_mode;
        Self::build(base.as_ref(), config, ctx)
    }

    /// Open an existing engine directory. A missing clean-shutdown marker
    /// triggers a dirty start with full log replay.
    pub fn open<P: AsRef<Path>>(base: P, config: EngineConfig) -> Result<Arc<Self>, Error> {
        Self::open_with(base.as_ref(), config, ForceMode::NoForce, false)
    }

    /// Open without accepting mutations: client writes and deletes are
    /// rejected, no background workers run and the clean-shutdown marker
    /// is left untouched.
    pub fn open_readonly<P: AsRef<Path>>(
        base: P,
        config: EngineConfig,
    ) -> Result<Arc<Self>, Error> {
        Self::open_with(base.as_ref(), config, ForceMode::NoForce, true)
    }

    /// Open, formatting a missing store in place instead of failing.
    pub fn open_force<P: AsRef<Path>>(base: P, config: EngineConfig) -> Result<Arc<Self>, Error> {
        Self::open_with(base.as_ref(), config, ForceMode::Force, false)
    }

    fn open_with(
        base: &Path,
        config: EngineConfig,
        force: ForceMode,
        readonly: bool,
    ) -> Result<Arc<Self>, Error> {
        if force == ForceMode::Force {
            dbs_tools::fs::create_dir(base, config.dir_mode)?;
        }
        let info = InfoStore::open(base.join("info"), config.dir_mode, config.file_mode)?;
        let state: Option<EngineStateRecord> = info.get(ENGINE_STATE_KEY)?;
        let clean = state.map(|record| record.clean_shutdown).unwrap_or(false);
        let mut ctx = StartContext::open(
            if clean {
                DirtyMode::Clean
            } else {
                DirtyMode::Dirty
            },
            !clean,
        );
        ctx.force = force;
        ctx.readonly = readonly;
        ctx.file_mode = config.file_mode;
        ctx.dir_mode = config.dir_mode;
        Self::build(base, config, ctx)
    }

    fn build(base: &Path, config: EngineConfig, mut ctx: StartContext) -> Result<Arc<Self>, Error> {
        if ctx.is_create() || ctx.force == ForceMode::Force {
            dbs_tools::fs::create_dir(base, ctx.dir_mode)?;
        }
        let lock = dbs_tools::fs::lock_file_exclusive(base.join("lock"), ctx.file_mode)?;
        let info = Arc::new(InfoStore::open(
            base.join("info"),
            ctx.dir_mode,
            ctx.file_mode,
        )?);

        let geometry = {
            let (block_size, fingerprint_size, container_size, file_count, slots) =
                config.geometry();
            GeometryRecord {
                block_size,
                fingerprint_size,
                container_size,
                container_file_count: file_count,
                container_slots_per_file: slots,
            }
        };
        match info.get::<GeometryRecord>(ENGINE_GEOMETRY_KEY)? {
            Some(existing) => {
                if ctx.is_create() {
                    bail!("engine directory {base:?} already holds a formatted store");
                }
                // geometry cannot change after the initial format
                if existing != geometry {
                    bail!("engine geometry does not match the on-disk store");
                }
            }
            None => {
                if !ctx.is_create() {
                    if ctx.force == ForceMode::Force {
                        log::warn!("no formatted store at {base:?}, formatting one (forced)");
                        ctx.create = CreateMode::Create;
                        ctx.dirty = DirtyMode::Clean;
                        ctx.has_crashed = false;
                    } else {
                        bail!("engine directory {base:?} holds no formatted store");
                    }
                }
                info.set(ENGINE_GEOMETRY_KEY, &geometry)?;
            }
        }

        let oplog = if ctx.is_create() {
            Arc::new(OpLog::create(
                base.join("oplog"),
                &config.oplog_config(),
                info.clone(),
            )?)
        } else {
            Arc::new(OpLog::open(
                base.join("oplog"),
                &config.oplog_config(),
                info.clone(),
            )?)
        };

        let storage = ContainerStorage::start(
            base,
            config.container_config(),
            &ctx,
            info.clone(),
            oplog.clone(),
        )?;

        let sampling: Arc<dyn SamplingStrategy> = if config.sampling_modulus == 0 {
            Arc::new(FullSamplingStrategy)
        } else {
            Arc::new(SuffixSamplingStrategy::new(config.sampling_modulus))
        };
        let chunk_index = ChunkIndex::start(
            base,
            config.chunk_config(),
            &ctx,
            info.clone(),
            storage.clone(),
            sampling,
        )?;
        let block_index = BlockIndex::start(
            base,
            config.block_config(),
            &ctx,
            storage.clone(),
            oplog.clone(),
        )?;

        // replay fan-out order: storage state first, then the indexes
        oplog.register_consumer(storage.clone());
        oplog.register_consumer(chunk_index.clone());
        oplog.register_consumer(block_index.clone());

        let gc = ContainerGc::new(storage.clone(), chunk_index.clone(), config.gc_config());

        let engine = Arc::new(Self {
            config,
            base: base.to_path_buf(),
            _lock: lock,
            info,
            oplog,
            storage,
            chunk_index,
            block_index,
            gc,
            chunk_importer: Mutex::new(None),
            block_importer: Mutex::new(None),
            background_replay: Mutex::new(None),
            state: Mutex::new(SystemState::Starting),
            readonly: ctx.readonly,
        });

        if ctx.is_dirty() {
            *engine.state.lock().unwrap() = SystemState::DirtyReplay;
            if ctx.has_crashed {
                log::warn!("crash detected, replaying the operations log");
            } else {
                log::warn!("unclean shutdown detected, replaying the operations log");
            }
            run_dirty_start_replay(&engine.oplog)?;
        }

        if !ctx.readonly {
            // from here on a crash means a dirty restart
            engine
                .info
                .set(ENGINE_STATE_KEY, &EngineStateRecord {
                    clean_shutdown: false,
                })?;
        }
        *engine.state.lock().unwrap() = SystemState::Started;

        if !ctx.readonly {
            *engine.chunk_importer.lock().unwrap() = Some(ChunkImporter::start(
                engine.chunk_index.clone(),
                engine.config.chunk_importer_threads,
                Duration::from_millis(500),
            ));
            *engine.block_importer.lock().unwrap() = Some(BlockImporter::start(
                engine.block_index.clone(),
                engine.config.block_importer_threads,
                Duration::from_millis(200),
            ));
            *engine.background_replay.lock().unwrap() = Some(BackgroundReplay::start(
                engine.oplog.clone(),
                64,
                Duration::from_millis(500),
            ));
            engine.gc.start();
        }

        *engine.state.lock().unwrap() = SystemState::Running;
        log::info!(
            "engine at {base:?} is running{}",
            if ctx.readonly { " (read-only)" } else { "" }
        );
        Ok(engine)
    }

    pub fn state(&self) -> SystemState {
        *self.state.lock().unwrap()
    }

    fn ensure_running(&self) -> Result<(), Error> {
        match self.state() {
            SystemState::Running | SystemState::Started => Ok(()),
            state => bail!("engine is not running (state {state:?})"),
        }
    }

    fn ensure_writable(&self) -> Result<(), Error> {
        self.ensure_running()?;
        if self.readonly {
            bail!("engine is opened read-only");
        }
        Ok(())
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    pub fn block_size(&self) -> u32 {
        self.config.block_size
    }

    pub fn oplog(&self) -> &Arc<OpLog> {
        &self.oplog
    }

    pub fn container_storage(&self) -> &Arc<ContainerStorage> {
        &self.storage
    }

    pub fn chunk_index(&self) -> &Arc<ChunkIndex> {
        &self.chunk_index
    }

    pub fn block_index(&self) -> &Arc<BlockIndex> {
        &self.block_index
    }

    pub fn gc(&self) -> &Arc<ContainerGc> {
        &self.gc
    }

    /// Write one block from a chunked payload stream.
    ///
    /// `chunks` is the ordered (fingerprint, payload) sequence the external
    /// chunker produced for this block; the summed payload must not exceed
    /// the block size, a short tail is padded with the empty-data
    /// fingerprint. Returns the new mapping version.
    pub fn write_block(
        &self,
        block_id: u64,
        chunks: &[(Fingerprint, &[u8])],
        ec: &mut ErrorContext,
    ) -> Result<u32, Error> {
        self.ensure_writable()?;

        let total: u64 = chunks.iter().map(|(_, data)| data.len() as u64).sum();
        if total > self.config.block_size as u64 {
            ec.set(ErrorFlags::INTEGRITY);
            bail!(
                "got {total} bytes for block {block_id}, block size is {}",
                self.config.block_size
            );
        }

        // back-pressure from the index caches
        let mut spins = 0u32;
        while self.chunk_index.throttle(0, 1) || self.block_index.throttle(0, 1) {
            self.chunk_index.flush_dirty(256)?;
            std::thread::sleep(Duration::from_millis(10));
            spins += 1;
            if spins > 1000 {
                ec.set(ErrorFlags::FULL);
                bail!("index caches stay saturated, rejecting write");
            }
        }

        let _guard = self
            .block_index
            .block_locks()
            .stripe(block_id)
            .write()
            .unwrap();

        let (previous, _source) = self.block_index.read_block_info(block_id)?;

        let mut items = Vec::with_capacity(chunks.len() + 1);
        for (fingerprint, payload) in chunks {
            if payload.is_empty() {
                continue;
            }
            if fingerprint.is_empty_data() {
                items.push(BlockMappingItem::empty_data(
                    self.config.fingerprint_size,
                    payload.len() as u32,
                ));
                continue;
            }

            let mut mapping = ChunkMapping::new(*fingerprint);
            let container_id = match self.chunk_index.lookup(&mut mapping, true)? {
                LookupResult::Found => mapping.container_id,
                LookupResult::NotFound => {
                    let indexed = self.chunk_index.should_index(fingerprint);
                    let container_id =
                        self.storage.add_chunk(*fingerprint, payload, indexed, ec)?;
                    if indexed {
                        let mut fresh = ChunkMapping::new(*fingerprint);
                        fresh.container_id = container_id;
                        self.chunk_index.put(&fresh, ec)?;
                    }
                    container_id
                }
            };
            items.push(BlockMappingItem {
                fingerprint: *fingerprint,
                container_id,
                chunk_offset: 0,
                chunk_size: payload.len() as u32,
            });
        }
        if total < self.config.block_size as u64 {
            items.push(BlockMappingItem::empty_data(
                self.config.fingerprint_size,
                (self.config.block_size as u64 - total) as u32,
            ));
        }

        let updated = BlockMapping {
            block_id,
            version: previous.version + 1,
            block_size: self.config.block_size,
            items,
            event_log_id: 0,
        };

        // the overwritten chunks must not be collected before the replay
        // has adjusted their usage counts
        for item in previous.items.iter().filter(|i| !i.is_empty_data()) {
            self.chunk_index.touch_in_combat(&item.fingerprint);
        }

        self.block_index.store_block(&previous, &updated, ec)?;

        if let Some(replay) = self.background_replay.lock().unwrap().as_ref() {
            replay.wake();
        }
        Ok(updated.version)
    }

    /// Read a block's contents. Unwritten ranges come back zeroed.
    pub fn read_block(&self, block_id: u64, ec: &mut ErrorContext) -> Result<Vec<u8>, Error> {
        self.ensure_running()?;

        let _guard = self
            .block_index
            .block_locks()
            .stripe(block_id)
            .read()
            .unwrap();

        let (mapping, _source) = self.block_index.read_block_info(block_id)?;
        let mut data = Vec::with_capacity(self.config.block_size as usize);
        for item in &mapping.items {
            if item.is_empty_data() {
                data.resize(data.len() + item.chunk_size as usize, 0);
                continue;
            }
            let payload = self
                .storage
                .read_chunk(item.container_id, &item.fingerprint, ec)?
                .ok_or_else(|| {
                    ec.set(ErrorFlags::INTEGRITY);
                    format_err!(
                        "chunk {} of block {block_id} not found in container {}",
                        item.fingerprint,
                        item.container_id
                    )
                })?;
            let start = item.chunk_offset as usize;
            let end = start + item.chunk_size as usize;
            if end > payload.len() {
                ec.set(ErrorFlags::INTEGRITY);
                bail!(
                    "chunk {} of block {block_id} is shorter than its mapping",
                    item.fingerprint
                );
            }
            data.extend_from_slice(&payload[start..end]);
        }

        if data.len() != self.config.block_size as usize {
            ec.set(ErrorFlags::INTEGRITY);
            bail!(
                "block {block_id} mapping covers {} bytes instead of {}",
                data.len(),
                self.config.block_size
            );
        }
        Ok(data)
    }

    /// Drop a block's mapping. Returns false when the block was never
    /// written.
    pub fn delete_block(&self, block_id: u64, ec: &mut ErrorContext) -> Result<bool, Error> {
        self.ensure_writable()?;

        let _guard = self
            .block_index
            .block_locks()
            .stripe(block_id)
            .write()
            .unwrap();

        let (original, source) = self.block_index.read_block_info(block_id)?;
        if source == BlockReadSource::NotFound {
            return Ok(false);
        }
        for item in original.items.iter().filter(|i| !i.is_empty_data()) {
            self.chunk_index.touch_in_combat(&item.fingerprint);
        }
        self.block_index.delete_block_info(block_id, ec)
    }

    /// Commit every open container and run all deferred work (replay,
    /// imports, failure handling) to completion.
    pub fn flush(&self) -> Result<(), Error> {
        if self.readonly {
            // nothing may be written, and nothing is in flight
            return Ok(());
        }
        self.storage.commit_open_containers();
        self.storage.wait_committer_idle();

        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            self.oplog.drain_background_replay()?;

            while let Some(container_id) = self.chunk_index.tracker().next_processing_container() {
                match self.chunk_index.import_container(container_id) {
                    Ok(()) => self.chunk_index.tracker().processed_container(container_id)?,
                    Err(err) => {
                        self.chunk_index
                            .tracker()
                            .abort_processing_container(container_id);
                        log::debug!("flush: import of {container_id} postponed - {err}");
                        break;
                    }
                }
            }

            self.block_index.process_failed_queue()?;
            while self
                .block_index
                .background_import_once(Duration::from_millis(1))?
                > 0
            {}

            let settled = self.oplog.pending_count() == 0
                && self.chunk_index.tracker().pending_count() == 0
                && self.chunk_index.tracker().processing_count() == 0
                && self.block_index.volatile().is_empty()
                && !self.block_index.has_queued_failures();
            if settled {
                return Ok(());
            }
            if Instant::now() > deadline {
                bail!("flush did not settle within 30 seconds");
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Graceful shutdown.
    pub fn stop(&self, mode: StopMode) -> Result<(), Error> {
        {
            let mut state = self.state.lock().unwrap();
            if *state == SystemState::Stopped {
                return Ok(());
            }
            *state = SystemState::Stopped;
        }
        log::info!("stopping engine ({mode:?})");

        self.gc.stop();
        if self.readonly {
            // no state of our own to persist, and the clean-shutdown
            // marker belongs to the writing instance
            self.stop_workers();
            self.storage.stop();
            return Ok(());
        }
        match mode {
            StopMode::Fast => {
                // data reaches disk, the index deltas are recovered from
                // the log on the next start
                self.storage.commit_open_containers();
                self.storage.wait_committer_idle();
            }
            StopMode::WriteBack => {
                self.flush()?;
                self.chunk_index.flush_all_dirty()?;
                self.block_index.flush_aux()?;
            }
        }

        self.stop_workers();
        self.storage.stop();
        self.storage.flush_meta_index()?;

        self.persist_statistics()?;
        self.info.set(ENGINE_STATE_KEY, &EngineStateRecord {
            clean_shutdown: true,
        })?;
        Ok(())
    }

    /// Drop in-flight state and leave the store dirty; the next open runs
    /// a dirty start. This is the crash path used by tests.
    pub fn force_stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == SystemState::Stopped {
                return;
            }
            *state = SystemState::Stopped;
        }
        log::warn!("forced stop, dropping in-flight operations");
        self.gc.stop();
        self.storage.drop_open_containers();
        self.stop_workers();
        self.storage.stop();
    }

    fn stop_workers(&self) {
        if let Some(importer) = self.chunk_importer.lock().unwrap().take() {
            importer.stop();
        }
        if let Some(importer) = self.block_importer.lock().unwrap().take() {
            importer.stop();
        }
        if let Some(mut replay) = self.background_replay.lock().unwrap().take() {
            replay.stop();
        }
    }

    /// Current counters, assembled across the subsystems.
    pub fn statistics(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            containers_committed: self.storage.stats.committed.load(Ordering::Relaxed),
            container_commit_failures: self
                .storage
                .stats
                .commit_failures
                .load(Ordering::Relaxed),
            container_merges: self.storage.stats.merges.load(Ordering::Relaxed),
            container_moves: self.storage.stats.moves.load(Ordering::Relaxed),
            container_deletes: self.storage.stats.deletes.load(Ordering::Relaxed),
            chunk_index_hits: self.chunk_index.stats.hits.load(Ordering::Relaxed),
            chunk_index_misses: self.chunk_index.stats.misses.load(Ordering::Relaxed),
            chunk_index_puts: self.chunk_index.stats.puts.load(Ordering::Relaxed),
            chunk_imports: self.chunk_index.stats.imports.load(Ordering::Relaxed),
            blocks_stored: self.block_index.stats.stored.load(Ordering::Relaxed),
            blocks_deleted: self.block_index.stats.deleted.load(Ordering::Relaxed),
            blocks_imported: self.block_index.stats.imported.load(Ordering::Relaxed),
            block_write_failures: self.block_index.stats.failed_writes.load(Ordering::Relaxed),
        }
    }

    pub fn persist_statistics(&self) -> Result<(), Error> {
        self.info.set(STATISTICS_KEY, &self.statistics())
    }

    /// The snapshot persisted by the previous run, if any.
    pub fn restore_statistics(&self) -> Result<Option<StatisticsSnapshot>, Error> {
        self.info.get(STATISTICS_KEY)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.state() != SystemState::Stopped {
            self.force_stop();
        }
    }
}
