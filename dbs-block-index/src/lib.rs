//! The block index.
//!
//! Maps block ids to ordered chunk lists. Fresh mappings live in the
//! in-memory auxiliary index until every container they reference is
//! durably committed; the background importer then moves them into the
//! persistent index, ordered by version. Write failures roll the auxiliary
//! entry back to the pre-failure state and are remembered in a small
//! persistent failed-writes index.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{bail, format_err, Error};

use dbs_api_types::{
    BlockMapping, BlockMappingItem, BlockMappingPair, ErrorContext, ErrorFlags, Fingerprint,
    StartContext, MAX_FINGERPRINT_SIZE,
};
use dbs_container::ContainerStorage;
use dbs_index::{DiskHashConfig, DiskHashIndex};
use dbs_oplog::{Event, LogConsumer, LogReplayContext, OpLog, ReplayMode};
use dbs_tools::lock_stripes::{rwlock_stripes, RwLockStripes};

mod volatile;
pub use volatile::{FailedVolatileBlock, VolatileBlockEntry, VolatileBlockStore};

mod importer;
pub use importer::BlockImporter;

// version 4 + event_log_id 8 + block_size 4 + item_count 4
const MAPPING_HEADER_SIZE: usize = 20;
// fp_size 1 + fp 32 + container_id 8 + chunk_offset 4 + chunk_size 4
const MAPPING_ITEM_SIZE: usize = 49;

const FAILED_WRITE_KEY_SIZE: usize = 12; // block_id u64 || version u32

#[derive(Clone, Debug)]
pub struct BlockIndexConfig {
    pub block_size: u32,
    pub fingerprint_size: usize,
    pub index_pages: u64,
    pub failed_write_pages: u64,
    /// Persistent value slot; bounds the per-block item count.
    pub value_slot_size: usize,
    /// Auxiliary index size triggering write throttling.
    pub aux_hard_limit: usize,
    pub import_batch: usize,
    pub block_lock_stripes: usize,
    pub file_mode: u32,
}

impl Default for BlockIndexConfig {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,
            fingerprint_size: dbs_api_types::DEFAULT_FINGERPRINT_SIZE,
            index_pages: 1024,
            failed_write_pages: 16,
            value_slot_size: 2048,
            aux_hard_limit: 8 * 1024,
            import_batch: 64,
            block_lock_stripes: 64,
            file_mode: 0o640,
        }
    }
}

/// Where `read_block_info` found the mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockReadSource {
    Aux,
    Main,
    NotFound,
}

fn encode_mapping(mapping: &BlockMapping, slot_size: usize) -> Result<Vec<u8>, Error> {
    use dbs_tools::io::WriteLeExt;

    let total = MAPPING_HEADER_SIZE + mapping.items.len() * MAPPING_ITEM_SIZE;
    if total > slot_size {
        bail!(
            "block {} mapping with {} items exceeds the {} byte slot",
            mapping.block_id,
            mapping.items.len(),
            slot_size
        );
    }

    let mut data = Vec::with_capacity(total);
    data.write_le_u32(mapping.version)?;
    data.write_le_u64(mapping.event_log_id)?;
    data.write_le_u32(mapping.block_size)?;
    data.write_le_u32(mapping.items.len() as u32)?;
    for item in &mapping.items {
        data.write_le_u8(item.fingerprint.size() as u8)?;
        let mut fp = [0u8; MAX_FINGERPRINT_SIZE];
        fp[..item.fingerprint.size()].copy_from_slice(item.fingerprint.as_bytes());
        data.extend_from_slice(&fp);
        data.write_le_u64(item.container_id)?;
        data.write_le_u32(item.chunk_offset)?;
        data.write_le_u32(item.chunk_size)?;
    }
    Ok(data)
}

fn decode_mapping(block_id: u64, data: &[u8]) -> Result<BlockMapping, Error> {
    use dbs_tools::io::ReadLeExt;

    let mut reader = data;
    let version = reader.read_le_u32()?;
    let event_log_id = reader.read_le_u64()?;
    let block_size = reader.read_le_u32()?;
    let item_count = reader.read_le_u32()? as usize;

    let mut items = Vec::with_capacity(item_count);
    for _ in 0..item_count {
        let fp_size = reader.read_le_u8()? as usize;
        let fp_buf = reader.read_exact_vec(MAX_FINGERPRINT_SIZE)?;
        if fp_size == 0 || fp_size > MAX_FINGERPRINT_SIZE {
            bail!("block {block_id} mapping has bad fingerprint size {fp_size}");
        }
        items.push(BlockMappingItem {
            fingerprint: Fingerprint::new(&fp_buf[..fp_size])?,
            container_id: reader.read_le_u64()?,
            chunk_offset: reader.read_le_u32()?,
            chunk_size: reader.read_le_u32()?,
        });
    }

    Ok(BlockMapping {
        block_id,
        version,
        block_size,
        items,
        event_log_id,
    })
}

fn failed_write_key(block_id: u64, version: u32) -> [u8; FAILED_WRITE_KEY_SIZE] {
    let mut key = [0u8; FAILED_WRITE_KEY_SIZE];
    key[0..8].copy_from_slice(&block_id.to_le_bytes());
    key[8..12].copy_from_slice(&version.to_le_bytes());
    key
}

#[derive(Default)]
pub struct BlockIndexStats {
    pub reads_aux: AtomicU64,
    pub reads_main: AtomicU64,
    pub reads_not_found: AtomicU64,
    pub stored: AtomicU64,
    pub deleted: AtomicU64,
    pub imported: AtomicU64,
    pub failed_writes: AtomicU64,
    pub throttled: AtomicU64,
}

/// The block index.
pub struct BlockIndex {
    config: BlockIndexConfig,
    persistent: DiskHashIndex,
    failed_writes: DiskHashIndex,
    aux: RwLock<BTreeMap<u64, BlockMapping>>,
    open_new_block_count: AtomicU64,
    volatile: VolatileBlockStore,
    block_locks: RwLockStripes,
    storage: Arc<ContainerStorage>,
    oplog: Arc<OpLog>,
    // write failures discovered inside log dispatch; handled by the
    // importer thread, which may commit events
    failed_queue: Mutex<Vec<(FailedVolatileBlock, Option<u64>)>>,
    pub stats: BlockIndexStats,
}

impl BlockIndex {
    pub fn start(
        base: &std::path::Path,
        config: BlockIndexConfig,
        ctx: &StartContext,
        storage: Arc<ContainerStorage>,
        oplog: Arc<OpLog>,
    ) -> Result<Arc<Self>, Error> {
        let index_path = base.join("block-index.dhi");
        let failed_path = base.join("failed-writes.dhi");

        let (persistent, failed_writes) = if ctx.is_create() {
            (
                DiskHashIndex::create(
                    &index_path,
                    DiskHashConfig {
                        page_size: 4096,
                        file_mode: config.file_mode,
                        ..DiskHashConfig::new(config.index_pages, 8, config.value_slot_size)
                    },
                )?,
                DiskHashIndex::create(
                    &failed_path,
                    DiskHashConfig {
                        file_mode: config.file_mode,
                        ..DiskHashConfig::new(config.failed_write_pages, FAILED_WRITE_KEY_SIZE, 0)
                    },
                )?,
            )
        } else {
            (
                DiskHashIndex::open(&index_path, 64)?,
                DiskHashIndex::open(&failed_path, 8)?,
            )
        };

        Ok(Arc::new(Self {
            aux: RwLock::new(BTreeMap::new()),
            open_new_block_count: AtomicU64::new(0),
            volatile: VolatileBlockStore::new(),
            block_locks: rwlock_stripes(config.block_lock_stripes),
            storage,
            oplog,
            failed_queue: Mutex::new(Vec::new()),
            stats: BlockIndexStats::default(),
            config,
            persistent,
            failed_writes,
        }))
    }

    pub fn block_size(&self) -> u32 {
        self.config.block_size
    }

    pub fn block_locks(&self) -> &RwLockStripes {
        &self.block_locks
    }

    pub fn volatile(&self) -> &VolatileBlockStore {
        &self.volatile
    }

    pub fn persistent_count(&self) -> u64 {
        self.persistent.item_count()
    }

    pub fn aux_count(&self) -> usize {
        self.aux.read().unwrap().len()
    }

    pub fn open_new_block_count(&self) -> u64 {
        self.open_new_block_count.load(Ordering::SeqCst)
    }

    /// The empty template handed out for blocks that were never written.
    pub fn empty_template(&self, block_id: u64) -> BlockMapping {
        BlockMapping::empty_template(block_id, self.config.block_size, self.config.fingerprint_size)
    }

    /// Look a block up in the auxiliary index, then the persistent index.
    /// Fills in the empty template when nowhere found. (The session's
    /// in-flight mappings are layered on top by the caller.)
    pub fn read_block_info(&self, block_id: u64) -> Result<(BlockMapping, BlockReadSource), Error> {
        if let Some(mapping) = self.aux.read().unwrap().get(&block_id) {
            self.stats.reads_aux.fetch_add(1, Ordering::Relaxed);
            return Ok((mapping.clone(), BlockReadSource::Aux));
        }
        if let Some(data) = self.persistent.get(&block_id.to_le_bytes())? {
            self.stats.reads_main.fetch_add(1, Ordering::Relaxed);
            return Ok((decode_mapping(block_id, &data)?, BlockReadSource::Main));
        }
        self.stats.reads_not_found.fetch_add(1, Ordering::Relaxed);
        Ok((self.empty_template(block_id), BlockReadSource::NotFound))
    }

    /// Throttle writers when the auxiliary index approaches its hard limit.
    pub fn throttle(&self, _thread_id: usize, _thread_count: usize) -> bool {
        if self.aux.read().unwrap().len() >= self.config.aux_hard_limit {
            self.stats.throttled.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Store a block mapping transition.
    ///
    /// The updated mapping goes to the auxiliary index, the transition is
    /// logged and handed to the volatile store with the set of referenced
    /// containers that are not yet committed. The caller must hold the
    /// block's write lock and have marked the previous chunks in-combat.
    pub fn store_block(
        &self,
        previous: &BlockMapping,
        updated: &BlockMapping,
        ec: &mut ErrorContext,
    ) -> Result<u64, Error> {
        updated.check_size()?;
        let pair = BlockMappingPair::new(previous.clone(), updated.clone())?;

        if previous.is_empty_template() {
            let live = self.persistent.item_count() + self.open_new_block_count();
            if live >= self.persistent.estimated_max_items() {
                ec.set(ErrorFlags::FULL);
                bail!("block index capacity reached ({live} live blocks)");
            }
        }

        let check = self
            .storage
            .block_mapping_storage_check(updated.referenced_container_ids());
        if !check.never_committed.is_empty() {
            ec.set(ErrorFlags::COMMIT_FAILED);
            bail!(
                "block {}: containers {:?} will never commit",
                updated.block_id,
                check.never_committed
            );
        }

        let displaced = {
            let mut aux = self.aux.write().unwrap();
            let mut stored = updated.clone();
            stored.event_log_id = 0; // set below, after the log assigns an id
            let displaced = aux.insert(updated.block_id, stored);
            if previous.is_empty_template() && displaced.is_none() {
                self.open_new_block_count.fetch_add(1, Ordering::SeqCst);
            }
            displaced
        };

        let log_id = match self.oplog.commit_event(
            &Event::BlockMappingWritten {
                mapping_pair: pair.clone(),
            },
            ec,
        ) {
            Ok(log_id) => log_id,
            Err(err) => {
                // not committed: undo the auxiliary update
                let mut aux = self.aux.write().unwrap();
                match displaced {
                    Some(old) => {
                        aux.insert(updated.block_id, old);
                    }
                    None => {
                        aux.remove(&updated.block_id);
                        if previous.is_empty_template() {
                            self.open_new_block_count.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                }
                return Err(err);
            }
        };

        {
            let mut aux = self.aux.write().unwrap();
            if let Some(entry) = aux.get_mut(&updated.block_id) {
                if entry.version == updated.version {
                    entry.event_log_id = log_id;
                }
            }
        }

        self.volatile.register(
            previous.clone(),
            {
                let mut modified = updated.clone();
                modified.event_log_id = log_id;
                modified
            },
            check.open.iter().copied().collect(),
            log_id,
        );

        self.stats.stored.fetch_add(1, Ordering::Relaxed);
        Ok(log_id)
    }

    /// Delete a block's mapping from both indexes.
    pub fn delete_block_info(&self, block_id: u64, ec: &mut ErrorContext) -> Result<bool, Error> {
        let (original, source) = self.read_block_info(block_id)?;
        if source == BlockReadSource::NotFound {
            ec.set(ErrorFlags::NOT_FOUND);
            return Ok(false);
        }

        self.oplog.commit_event(
            &Event::BlockMappingDeleted {
                original: original.clone(),
            },
            ec,
        )?;

        self.remove_block(block_id)?;
        // a deleted block may be recreated at version 1; stale failure
        // markers must not shadow the recreated mapping
        self.failed_writes
            .delete(&failed_write_key(block_id, original.version))?;
        self.stats.deleted.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn remove_block(&self, block_id: u64) -> Result<(), Error> {
        let persisted = self.persistent.delete(&block_id.to_le_bytes())?;
        let from_aux = self.aux.write().unwrap().remove(&block_id).is_some();
        if from_aux && !persisted {
            // a block that never reached the persistent index
            let _ = self.open_new_block_count.fetch_update(
                Ordering::SeqCst,
                Ordering::SeqCst,
                |count| count.checked_sub(1),
            );
        }
        Ok(())
    }

    /// Mark a block write as failed: remember (block id, version) in the
    /// failed-writes index, emit the failure event and roll the auxiliary
    /// entry back so readers see the pre-failure state.
    pub fn mark_block_write_as_failed(
        &self,
        pair: &BlockMappingPair,
        write_event_log_id: Option<u64>,
        ec: &mut ErrorContext,
    ) -> Result<(), Error> {
        self.oplog.commit_event(
            &Event::BlockMappingWriteFailed {
                mapping_pair: pair.clone(),
                write_event_log_id,
            },
            ec,
        )?;
        self.apply_write_failed(pair)?;
        self.stats.failed_writes.fetch_add(1, Ordering::Relaxed);
        log::warn!(
            "block {} version {} write failed",
            pair.block_id(),
            pair.updated.version
        );
        Ok(())
    }

    /// The event-side effects of a failed write (also used when replaying
    /// pre-crash failure events).
    fn apply_write_failed(&self, pair: &BlockMappingPair) -> Result<(), Error> {
        self.failed_writes
            .put(&failed_write_key(pair.block_id(), pair.updated.version), b"")?;

        let rollback = {
            let mut aux = self.aux.write().unwrap();
            // only when the failed contents are still in place; a chain
            // rollback may already have restored older contents under
            // this version
            let rollback = aux
                .get(&pair.block_id())
                .map(|entry| {
                    entry.version == pair.updated.version && entry.items == pair.updated.items
                })
                .unwrap_or(false);
            if rollback {
                // readers see the pre-failure contents again, but the
                // version stays at the failing one: the next write gets a
                // fresh version and can never collide with the marker
                let mut restored = pair.previous.clone();
                restored.version = pair.updated.version;
                restored.event_log_id = pair.previous.event_log_id;
                aux.insert(pair.block_id(), restored);
            }
            rollback
        };
        if rollback {
            // let the importer persist the rolled-back state
            self.volatile.requeue((pair.block_id(), pair.updated.version));
        }
        Ok(())
    }

    pub fn is_write_failed(&self, block_id: u64, version: u32) -> Result<bool, Error> {
        Ok(self
            .failed_writes
            .get(&failed_write_key(block_id, version))?
            .is_some())
    }

    /// Install `mapping` into the persistent index if it is newer than
    /// what is there. Returns whether it was installed.
    fn install_persistent(&self, mapping: &BlockMapping) -> Result<bool, Error> {
        let key = mapping.block_id.to_le_bytes();
        let existing_version = match self.persistent.get(&key)? {
            Some(data) => Some(decode_mapping(mapping.block_id, &data)?.version),
            None => None,
        };
        if let Some(existing) = existing_version {
            if existing >= mapping.version {
                return Ok(false);
            }
        }
        self.persistent
            .put(&key, &encode_mapping(mapping, self.config.value_slot_size)?)?;
        if existing_version.is_none() {
            // moved from "new in aux" to persistent
            let _ = self.open_new_block_count.fetch_update(
                Ordering::SeqCst,
                Ordering::SeqCst,
                |count| count.checked_sub(1),
            );
        }
        Ok(true)
    }

    /// Drop the auxiliary entry if it still carries `version`.
    fn drop_aux_if_version(&self, block_id: u64, version: u32) {
        let mut aux = self.aux.write().unwrap();
        let matches = aux
            .get(&block_id)
            .map(|entry| entry.version <= version)
            .unwrap_or(false);
        if matches {
            aux.remove(&block_id);
        }
    }

    /// One round of the background importer: pull ready transitions,
    /// dedupe by block keeping the highest version, install under the
    /// block write lock.
    pub fn background_import_once(&self, timeout: Duration) -> Result<usize, Error> {
        self.process_failed_queue()?;

        let batch = self
            .volatile
            .take_ready(self.config.import_batch, timeout);
        if batch.is_empty() {
            return Ok(0);
        }

        let mut by_block: BTreeMap<u64, u32> = BTreeMap::new();
        for (block_id, version) in batch {
            let entry = by_block.entry(block_id).or_insert(version);
            *entry = (*entry).max(version);
        }

        let mut imported = 0;
        for (block_id, version) in by_block {
            let guard = match self.block_locks.stripe(block_id).try_write() {
                Ok(guard) => guard,
                Err(_) => {
                    // contested; retry on a later round
                    self.volatile.requeue((block_id, version));
                    continue;
                }
            };

            let mapping = match self.aux.read().unwrap().get(&block_id) {
                Some(mapping) => mapping.clone(),
                None => {
                    drop(guard);
                    continue; // deleted or already imported
                }
            };
            if mapping.version < version {
                drop(guard);
                continue; // rolled back by a write failure
            }

            // the persistent index must never reference an uncommitted
            // container
            let check = self
                .storage
                .block_mapping_storage_check(mapping.referenced_container_ids());
            if !check.all_committed() {
                log::warn!(
                    "block {block_id}: not importable yet, containers missing ({:?})",
                    check
                );
                drop(guard);
                continue;
            }

            if self.install_persistent(&mapping)? {
                imported += 1;
                self.stats.imported.fetch_add(1, Ordering::Relaxed);
            }
            self.drop_aux_if_version(block_id, mapping.version);
            drop(guard);
        }
        Ok(imported)
    }

    /// Handle write failures queued from inside log dispatch (where no new
    /// events may be committed).
    pub fn process_failed_queue(&self) -> Result<(), Error> {
        loop {
            let next = self.failed_queue.lock().unwrap().pop();
            let (failed, write_event_log_id) = match next {
                Some(entry) => entry,
                None => return Ok(()),
            };
            let pair = BlockMappingPair {
                previous: failed.original,
                updated: failed.modified,
            };
            let mut ec = ErrorContext::new();
            self.mark_block_write_as_failed(&pair, write_event_log_id, &mut ec)?;
        }
    }

    pub fn has_queued_failures(&self) -> bool {
        !self.failed_queue.lock().unwrap().is_empty()
    }

    /// Flush the auxiliary index into the persistent index (write-back
    /// shutdown). Only mappings whose containers are all committed can go.
    pub fn flush_aux(&self) -> Result<(), Error> {
        let snapshot: Vec<BlockMapping> = self.aux.read().unwrap().values().cloned().collect();
        for mapping in snapshot {
            let check = self
                .storage
                .block_mapping_storage_check(mapping.referenced_container_ids());
            if !check.all_committed() {
                log::warn!(
                    "block {} still waits for containers at shutdown",
                    mapping.block_id
                );
                continue;
            }
            let _guard = self.block_locks.stripe(mapping.block_id).write().unwrap();
            self.install_persistent(&mapping)?;
            self.drop_aux_if_version(mapping.block_id, mapping.version);
        }
        self.persistent.flush()
    }

    /// Visit every entry of the persistent index (checker, restorer).
    pub fn iterate_persistent(
        &self,
        mut callback: impl FnMut(BlockMapping) -> Result<(), Error>,
    ) -> Result<(), Error> {
        self.persistent.iterate(|key, value| {
            let block_id = u64::from_le_bytes(
                key.try_into()
                    .map_err(|_| format_err!("block index key has invalid size"))?,
            );
            callback(decode_mapping(block_id, value)?)
        })
    }

    // ---- log replay ----------------------------------------------------

    /// Dirty start reconstruction for one `BlockMappingWritten` event.
    fn replay_written_dirty(
        &self,
        pair: &BlockMappingPair,
        context: &LogReplayContext,
    ) -> Result<(), Error> {
        if self.is_write_failed(pair.block_id(), pair.updated.version)? {
            return Ok(()); // failed pre-crash, the failure event follows
        }

        // rebuild the auxiliary entry unless something newer is known
        {
            let mut aux = self.aux.write().unwrap();
            let stale = aux
                .get(&pair.block_id())
                .map(|entry| entry.version >= pair.updated.version)
                .unwrap_or(false);
            if !stale {
                let mut mapping = pair.updated.clone();
                mapping.event_log_id = context.log_id;
                let was_known = aux.insert(pair.block_id(), mapping).is_some();
                if pair.previous.is_empty_template()
                    && !was_known
                    && self
                        .persistent
                        .get(&pair.block_id().to_le_bytes())?
                        .is_none()
                {
                    self.open_new_block_count.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        // containers committed later in the log resolve via the volatile
        // store; everything still open at the end of replay has failed
        let check = self
            .storage
            .block_mapping_storage_check(pair.updated.referenced_container_ids());
        let mut modified = pair.updated.clone();
        modified.event_log_id = context.log_id;
        let open: std::collections::BTreeSet<u64> = check
            .open
            .iter()
            .chain(check.never_committed.iter())
            .copied()
            .collect();
        self.volatile
            .register(pair.previous.clone(), modified, open, context.log_id);
        Ok(())
    }

    /// Background persistence for one `BlockMappingWritten` event.
    fn replay_written_background(
        &self,
        pair: &BlockMappingPair,
        context: &LogReplayContext,
    ) -> Result<(), Error> {
        if self.is_write_failed(pair.block_id(), pair.updated.version)? {
            return Ok(());
        }

        let check = self
            .storage
            .block_mapping_storage_check(pair.updated.referenced_container_ids());
        if !check.never_committed.is_empty() {
            // found out only now: the mapping references containers that
            // can never commit
            let mut ec = ErrorContext::new();
            self.mark_block_write_as_failed(pair, Some(context.log_id), &mut ec)?;
            return Ok(());
        }
        if !check.open.is_empty() {
            // the replay cursor must not pass a mapping whose containers
            // are still open; the volatile store usually resolves it
            // before the next round
            return Err(dbs_oplog::ReplayDeferred.into());
        }

        // import whichever of (event-stored, auxiliary) is newer
        let aux_entry = self.aux.read().unwrap().get(&pair.block_id()).cloned();
        let mut mapping = match aux_entry {
            Some(aux) if aux.version >= pair.updated.version => aux,
            _ => pair.updated.clone(),
        };
        if mapping.event_log_id == 0 {
            mapping.event_log_id = context.log_id;
        }

        let _guard = self.block_locks.stripe(pair.block_id()).write().unwrap();
        self.install_persistent(&mapping)?;
        self.drop_aux_if_version(pair.block_id(), mapping.version);
        Ok(())
    }

    /// End of dirty start: every transition still waiting on a container
    /// has failed, roll the auxiliary back and queue the failure events.
    ///
    /// Several versions of the same block can fail together (overwrites of
    /// an uncommitted write); the block rolls back to the oldest pre-crash
    /// contents, kept under the highest failing version so future writes
    /// never collide with a failure marker.
    fn finish_dirty_log_replay(&self) -> Result<(), Error> {
        let open = self.volatile.drain_open();
        if open.is_empty() {
            return Ok(());
        }
        log::warn!("{} block writes did not survive the crash", open.len());

        let mut by_block: BTreeMap<u64, Vec<FailedVolatileBlock>> = BTreeMap::new();
        for failed in open {
            by_block.entry(failed.modified.block_id).or_default().push(failed);
        }

        let mut queue = self.failed_queue.lock().unwrap();
        for (block_id, mut chain) in by_block {
            chain.sort_by_key(|failed| failed.modified.version);
            let highest_version = chain.last().unwrap().modified.version;

            // readers must see the pre-crash contents right away; the
            // failure events themselves are committed after replay
            let mut restored = chain.first().unwrap().original.clone();
            restored.version = highest_version;
            {
                let mut aux = self.aux.write().unwrap();
                aux.insert(block_id, restored);
            }
            self.volatile.requeue((block_id, highest_version));

            for failed in chain {
                self.failed_writes.put(
                    &failed_write_key(block_id, failed.modified.version),
                    b"",
                )?;
                let write_event_log_id = Some(failed.write_event_log_id);
                queue.push((failed, write_event_log_id));
            }
        }
        Ok(())
    }
}

impl LogConsumer for BlockIndex {
    fn name(&self) -> &'static str {
        "block-index"
    }

    fn apply(&self, event: &Event, context: &LogReplayContext) -> Result<(), Error> {
        match event {
            Event::ContainerCommitted { container_id, .. } => {
                if context.mode != ReplayMode::Background {
                    self.volatile.on_container_committed(*container_id);
                }
                Ok(())
            }
            Event::ContainerCommitFailed { container_id, .. } => {
                if context.mode == ReplayMode::Background {
                    return Ok(());
                }
                let failed = self.volatile.on_container_commit_failed(*container_id);
                if !failed.is_empty() {
                    let mut queue = self.failed_queue.lock().unwrap();
                    for entry in failed {
                        let pair = BlockMappingPair {
                            previous: entry.original.clone(),
                            updated: entry.modified.clone(),
                        };
                        self.apply_write_failed(&pair)?;
                        let write_event_log_id = Some(entry.write_event_log_id);
                        queue.push((entry, write_event_log_id));
                    }
                }
                Ok(())
            }
            Event::BlockMappingWritten { mapping_pair } => match context.mode {
                ReplayMode::Direct => Ok(()),
                ReplayMode::DirtyStart => self.replay_written_dirty(mapping_pair, context),
                ReplayMode::Background => self.replay_written_background(mapping_pair, context),
            },
            Event::BlockMappingDeleted { original } => match context.mode {
                ReplayMode::Direct => Ok(()),
                ReplayMode::DirtyStart | ReplayMode::Background => {
                    self.remove_block(original.block_id)?;
                    self.failed_writes
                        .delete(&failed_write_key(original.block_id, original.version))?;
                    Ok(())
                }
            },
            Event::BlockMappingWriteFailed { mapping_pair, .. } => match context.mode {
                ReplayMode::Direct => Ok(()),
                ReplayMode::DirtyStart => self.apply_write_failed(mapping_pair),
                ReplayMode::Background => {
                    self.apply_write_failed(mapping_pair)?;
                    // the skipped write event is behind the cursor now,
                    // the marker has served its purpose
                    self.failed_writes.delete(&failed_write_key(
                        mapping_pair.block_id(),
                        mapping_pair.updated.version,
                    ))?;
                    Ok(())
                }
            },
            Event::ReplayStopped {
                replay_type: ReplayMode::DirtyStart,
                success: true,
            } => self.finish_dirty_log_replay(),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn mapping_codec_roundtrip() {
        let mut mapping = BlockMapping::empty_template(9, 8192, 20);
        mapping.version = 3;
        mapping.event_log_id = 77;
        mapping.items = vec![
            BlockMappingItem {
                fingerprint: Fingerprint::new(&[5u8; 20]).unwrap(),
                container_id: 12,
                chunk_offset: 0,
                chunk_size: 4096,
            },
            BlockMappingItem::empty_data(20, 4096),
        ];
        mapping.check_size().unwrap();

        let data = encode_mapping(&mapping, 2048).unwrap();
        let back = decode_mapping(9, &data).unwrap();
        assert_eq!(back, mapping);
    }

    #[test]
    fn oversized_mapping_is_rejected() {
        let mut mapping = BlockMapping::empty_template(1, 4096, 20);
        mapping.items = (0..100)
            .map(|i| BlockMappingItem {
                fingerprint: Fingerprint::new(&[i as u8; 20]).unwrap(),
                container_id: 1,
                chunk_offset: 0,
                chunk_size: 41,
            })
            .collect();
        assert!(encode_mapping(&mapping, 2048).is_err());
    }

    #[test]
    fn failed_write_keys_are_distinct() {
        assert_ne!(failed_write_key(1, 2), failed_write_key(2, 1));
        assert_ne!(failed_write_key(1, 1), failed_write_key(1, 2));
    }
}
