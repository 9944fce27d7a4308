//! The chunk index.
//!
//! A persistent fingerprint → (container id, usage count) map with a dirty
//! write-back cache in front. New entries are born *pinned*: they may not
//! be flushed or evicted until the container holding the chunk payload is
//! durably committed, so the persistent index never references an
//! uncommitted container. The container tracker drives lazy import of
//! committed containers; usage counts are maintained by log replay.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Error};

use dbs_api_types::{
    ChunkMapping, ErrorContext, ErrorFlags, Fingerprint, LookupResult, StartContext,
};
use dbs_container::{ChunkGarbage, CommitState, ContainerStorage};
use dbs_index::{DiskHashConfig, DiskHashIndex, InfoStore, WriteBackCache};
use dbs_oplog::{Event, LogConsumer, LogReplayContext, ReplayMode};

mod sampling;
pub use sampling::{FullSamplingStrategy, SamplingStrategy, SuffixSamplingStrategy};

mod tracker;
pub use tracker::ContainerTracker;

mod importer;
pub use importer::ChunkImporter;

const CHUNK_VALUE_SIZE: usize = 32;

#[derive(Clone, Debug)]
pub struct ChunkIndexConfig {
    pub fingerprint_size: usize,
    pub index_pages: u64,
    pub cache_capacity: usize,
    /// Dirty ratio starting proactive flushes.
    pub flush_ratio: f64,
    /// Stricter flush ratio while a log replay is running.
    pub replay_flush_ratio: f64,
    /// Dirty ratio above which writers are throttled.
    pub throttle_ratio: f64,
    pub flush_batch: usize,
    pub file_mode: u32,
}

impl Default for ChunkIndexConfig {
    fn default() -> Self {
        Self {
            fingerprint_size: dbs_api_types::DEFAULT_FINGERPRINT_SIZE,
            index_pages: 1024,
            cache_capacity: 16 * 1024,
            flush_ratio: 0.70,
            replay_flush_ratio: 0.50,
            throttle_ratio: 0.80,
            flush_batch: 256,
            file_mode: 0o640,
        }
    }
}

/// Outcome of [`ChunkIndex::ensure_persistent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// The entry is on disk now.
    Persisted,
    /// The entry is still pinned and stays in the cache.
    Keep,
    NotFound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ChunkValue {
    container_id: u64,
    usage_count: i32,
    usage_count_change_log_id: u64,
}

impl ChunkValue {
    fn to_mapping(self, fingerprint: Fingerprint) -> ChunkMapping {
        ChunkMapping {
            fingerprint,
            container_id: self.container_id,
            usage_count: self.usage_count,
            usage_count_change_log_id: self.usage_count_change_log_id,
        }
    }

    fn of_mapping(mapping: &ChunkMapping) -> Self {
        Self {
            container_id: mapping.container_id,
            usage_count: mapping.usage_count,
            usage_count_change_log_id: mapping.usage_count_change_log_id,
        }
    }
}

fn encode_value(value: &ChunkValue) -> [u8; CHUNK_VALUE_SIZE] {
    let mut data = [0u8; CHUNK_VALUE_SIZE];
    data[0..8].copy_from_slice(&value.container_id.to_le_bytes());
    data[8..12].copy_from_slice(&value.usage_count.to_le_bytes());
    data[12..20].copy_from_slice(&value.usage_count_change_log_id.to_le_bytes());
    data
}

fn decode_value(data: &[u8]) -> Result<ChunkValue, Error> {
    if data.len() != CHUNK_VALUE_SIZE {
        bail!("chunk index entry has invalid size {}", data.len());
    }
    Ok(ChunkValue {
        container_id: u64::from_le_bytes(data[0..8].try_into().unwrap()),
        usage_count: i32::from_le_bytes(data[8..12].try_into().unwrap()),
        usage_count_change_log_id: u64::from_le_bytes(data[12..20].try_into().unwrap()),
    })
}

#[derive(Default)]
pub struct ChunkIndexStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub puts: AtomicU64,
    pub imports: AtomicU64,
    pub flushed_entries: AtomicU64,
    pub throttled: AtomicU64,
}

/// The chunk index.
pub struct ChunkIndex {
    config: ChunkIndexConfig,
    persistent: DiskHashIndex,
    cache: Mutex<WriteBackCache<ChunkValue>>,
    // fingerprint prefixes guarded against GC until replay passes; counted,
    // several in-flight writes may guard the same prefix
    in_combat: Mutex<HashMap<u64, u32>>,
    tracker: ContainerTracker,
    storage: Arc<ContainerStorage>,
    sampling: Arc<dyn SamplingStrategy>,
    in_replay: AtomicBool,
    pub stats: ChunkIndexStats,
}

impl ChunkIndex {
    pub fn start(
        base: &std::path::Path,
        config: ChunkIndexConfig,
        ctx: &StartContext,
        info: Arc<InfoStore>,
        storage: Arc<ContainerStorage>,
        sampling: Arc<dyn SamplingStrategy>,
    ) -> Result<Arc<Self>, Error> {
        let path = base.join("chunk-index.dhi");
        let persistent = if ctx.is_create() {
            DiskHashIndex::create(
                &path,
                DiskHashConfig {
                    file_mode: config.file_mode,
                    ..DiskHashConfig::new(
                        config.index_pages,
                        config.fingerprint_size,
                        CHUNK_VALUE_SIZE,
                    )
                },
            )?
        } else {
            DiskHashIndex::open(&path, 64)?
        };

        Ok(Arc::new(Self {
            cache: Mutex::new(WriteBackCache::new(config.cache_capacity)),
            in_combat: Mutex::new(HashMap::new()),
            tracker: ContainerTracker::open(info)?,
            storage,
            sampling,
            in_replay: AtomicBool::new(false),
            stats: ChunkIndexStats::default(),
            config,
            persistent,
        }))
    }

    pub fn tracker(&self) -> &ContainerTracker {
        &self.tracker
    }

    pub fn persistent_count(&self) -> u64 {
        self.persistent.item_count()
    }

    pub fn estimated_max_items(&self) -> u64 {
        self.persistent.estimated_max_items()
    }

    pub fn dirty_count(&self) -> usize {
        self.cache.lock().unwrap().dirty_count()
    }

    fn check_fingerprint(&self, fingerprint: &Fingerprint) -> Result<(), Error> {
        if fingerprint.size() != self.config.fingerprint_size {
            bail!(
                "got fingerprint of {} bytes, expected {}",
                fingerprint.size(),
                self.config.fingerprint_size
            );
        }
        Ok(())
    }

    fn load_value(&self, fingerprint: &Fingerprint) -> Result<Option<ChunkValue>, Error> {
        if let Some(value) = self.cache.lock().unwrap().value(fingerprint.as_bytes()) {
            return Ok(Some(*value));
        }
        match self.persistent.get(fingerprint.as_bytes())? {
            Some(data) => Ok(Some(decode_value(&data)?)),
            None => Ok(None),
        }
    }

    /// Look up a fingerprint, filling in container id and usage count.
    pub fn lookup(
        &self,
        mapping: &mut ChunkMapping,
        add_as_in_combat: bool,
    ) -> Result<LookupResult, Error> {
        self.check_fingerprint(&mapping.fingerprint)?;

        if add_as_in_combat {
            self.touch_in_combat(&mapping.fingerprint);
        }

        match self.load_value(&mapping.fingerprint)? {
            Some(value) => {
                *mapping = value.to_mapping(mapping.fingerprint);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Ok(LookupResult::Found)
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Ok(LookupResult::NotFound)
            }
        }
    }

    /// Whether a fingerprint takes part in deduplication at all.
    pub fn should_index(&self, fingerprint: &Fingerprint) -> bool {
        self.sampling.should_index(fingerprint)
    }

    /// Insert a new entry, pinned until its container commits.
    pub fn put(&self, mapping: &ChunkMapping, ec: &mut ErrorContext) -> Result<(), Error> {
        self.check_fingerprint(&mapping.fingerprint)?;

        if self.persistent.is_full() {
            ec.set(ErrorFlags::FULL);
            bail!("chunk index capacity reached ({} items)", self.persistent.item_count());
        }

        let value = ChunkValue::of_mapping(mapping);

        {
            let mut cache = self.cache.lock().unwrap();
            if let Err(err) = cache.insert(mapping.fingerprint.as_bytes(), value, true, true) {
                drop(cache);
                // everything resident is dirty or pinned; push dirt out and
                // retry once
                self.flush_dirty(self.config.flush_batch)?;
                let mut cache = self.cache.lock().unwrap();
                cache
                    .insert(mapping.fingerprint.as_bytes(), value, true, true)
                    .map_err(|_| {
                        ec.set(ErrorFlags::FULL);
                        err
                    })?;
            }
        }
        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        self.maybe_flush()?;
        Ok(())
    }

    /// Unpinned overwrite, used by the checker and the restorer.
    pub fn put_overwrite(&self, mapping: &ChunkMapping) -> Result<(), Error> {
        self.check_fingerprint(&mapping.fingerprint)?;
        let value = ChunkValue::of_mapping(mapping);
        self.persistent
            .put(mapping.fingerprint.as_bytes(), &encode_value(&value))?;
        let mut cache = self.cache.lock().unwrap();
        if cache.contains(mapping.fingerprint.as_bytes()) {
            cache.insert(mapping.fingerprint.as_bytes(), value, false, false)?;
        }
        Ok(())
    }

    /// Toggle the pin flag of a cached entry. Infallible: unknown keys are
    /// ignored.
    pub fn change_pinning_state(&self, fingerprint: &Fingerprint, pinned: bool) {
        self.cache
            .lock()
            .unwrap()
            .set_pinned(fingerprint.as_bytes(), pinned);
    }

    /// Force an entry onto disk unless it is still pinned.
    pub fn ensure_persistent(&self, fingerprint: &Fingerprint) -> Result<EnsureOutcome, Error> {
        let mut cache = self.cache.lock().unwrap();
        match cache.get(fingerprint.as_bytes()) {
            Some(entry) if entry.pinned => Ok(EnsureOutcome::Keep),
            Some(entry) if entry.dirty => {
                let value = entry.value;
                self.persistent
                    .put(fingerprint.as_bytes(), &encode_value(&value))?;
                cache.mark_clean(&[fingerprint.as_bytes().to_vec()]);
                Ok(EnsureOutcome::Persisted)
            }
            Some(_) => Ok(EnsureOutcome::Persisted),
            None => {
                if self.persistent.get(fingerprint.as_bytes())?.is_some() {
                    Ok(EnsureOutcome::Persisted)
                } else {
                    Ok(EnsureOutcome::NotFound)
                }
            }
        }
    }

    pub fn delete(&self, fingerprint: &Fingerprint) -> Result<(), Error> {
        self.cache.lock().unwrap().remove(fingerprint.as_bytes());
        self.persistent.delete(fingerprint.as_bytes())?;
        Ok(())
    }

    pub fn touch_in_combat(&self, fingerprint: &Fingerprint) {
        let mut in_combat = self.in_combat.lock().unwrap();
        let count = in_combat.entry(fingerprint.prefix()).or_insert(0);
        *count = count.saturating_add(1);
    }

    fn clear_in_combat(&self, fingerprint: &Fingerprint) {
        let mut in_combat = self.in_combat.lock().unwrap();
        if let Some(count) = in_combat.get_mut(&fingerprint.prefix()) {
            *count -= 1;
            if *count == 0 {
                in_combat.remove(&fingerprint.prefix());
            }
        }
    }

    fn clear_mapping_in_combat(&self, mapping: &dbs_api_types::BlockMapping) {
        for item in mapping.items.iter().filter(|i| !i.is_empty_data()) {
            self.clear_in_combat(&item.fingerprint);
        }
    }

    pub fn is_in_combat(&self, fingerprint: &Fingerprint) -> bool {
        self.in_combat
            .lock()
            .unwrap()
            .contains_key(&fingerprint.prefix())
    }

    /// Signal upper layers to pause when the dirty ratio is too high.
    pub fn throttle(&self, _thread_id: usize, _thread_count: usize) -> bool {
        let ratio = self.cache.lock().unwrap().dirty_ratio();
        if ratio > self.config.throttle_ratio {
            self.stats.throttled.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    fn maybe_flush(&self) -> Result<(), Error> {
        let threshold = if self.in_replay.load(Ordering::SeqCst) {
            self.config.replay_flush_ratio
        } else {
            self.config.flush_ratio
        };
        if self.cache.lock().unwrap().dirty_ratio() > threshold {
            self.flush_dirty(self.config.flush_batch)?;
        }
        Ok(())
    }

    /// Write a batch of dirty unpinned entries to the persistent index.
    pub fn flush_dirty(&self, max: usize) -> Result<usize, Error> {
        let batch = self.cache.lock().unwrap().flush_candidates(max);
        if batch.entries.is_empty() {
            return Ok(0);
        }
        let mut flushed = Vec::with_capacity(batch.entries.len());
        for (key, value) in &batch.entries {
            self.persistent.put(key, &encode_value(value))?;
            flushed.push(key.clone());
        }
        self.persistent.flush()?;
        self.cache.lock().unwrap().mark_clean(&flushed);
        self.stats
            .flushed_entries
            .fetch_add(flushed.len() as u64, Ordering::Relaxed);
        Ok(flushed.len())
    }

    /// Flush everything flushable (shutdown, checkpoints).
    pub fn flush_all_dirty(&self) -> Result<(), Error> {
        loop {
            if self.flush_dirty(self.config.flush_batch)? == 0 {
                return Ok(());
            }
        }
    }

    /// Import a committed container: unpin resident entries and insert any
    /// missing ones with usage count zero.
    pub fn import_container(&self, container_id: u64) -> Result<(), Error> {
        match self.storage.commit_state(container_id) {
            CommitState::Committed => {}
            CommitState::WillNeverCommit => {
                log::debug!("container {container_id} will never commit, nothing to import");
                return Ok(());
            }
            state => {
                bail!("container {container_id} is not importable (state {state:?})");
            }
        }

        let mut ec = ErrorContext::new();
        let container = self.storage.read_container(container_id, &mut ec)?;
        for item in container.items() {
            if item.is_deleted || !item.is_indexed {
                continue;
            }
            let key = item.key;
            let mut cache = self.cache.lock().unwrap();
            if cache.contains(key.as_bytes()) {
                cache.set_pinned(key.as_bytes(), false);
                continue;
            }
            drop(cache);
            if self.persistent.get(key.as_bytes())?.is_none() {
                if self.persistent.is_full() {
                    log::warn!("chunk index full, cannot import chunk {key}");
                    continue;
                }
                // recovered entry; usage counts are rebuilt by replay
                let value = ChunkValue {
                    container_id: item.original_id,
                    usage_count: 0,
                    usage_count_change_log_id: 0,
                };
                self.persistent.put(key.as_bytes(), &encode_value(&value))?;
            }
        }
        self.stats.imports.fetch_add(1, Ordering::Relaxed);
        self.maybe_flush()?;
        Ok(())
    }

    /// Visit every entry of the persistent index (checker, restorer).
    pub fn iterate_persistent(
        &self,
        mut callback: impl FnMut(ChunkMapping) -> Result<(), Error>,
    ) -> Result<(), Error> {
        self.persistent.iterate(|key, value| {
            let decoded = decode_value(value)?;
            callback(decoded.to_mapping(Fingerprint::new(key)?))
        })
    }

    /// Drop every persistent entry and the cache (restorer only).
    pub fn clear_persistent(&self) -> Result<(), Error> {
        self.persistent.clear()?;
        let mut cache = self.cache.lock().unwrap();
        *cache = WriteBackCache::new(self.config.cache_capacity);
        Ok(())
    }

    /// Net usage-count deltas of a block mapping event.
    fn collect_deltas(
        updated: Option<&dbs_api_types::BlockMapping>,
        previous: Option<&dbs_api_types::BlockMapping>,
    ) -> HashMap<Fingerprint, (i32, u64)> {
        let mut deltas: HashMap<Fingerprint, (i32, u64)> = HashMap::new();
        if let Some(updated) = updated {
            for item in updated.items.iter().filter(|i| !i.is_empty_data()) {
                let entry = deltas.entry(item.fingerprint).or_insert((0, item.container_id));
                entry.0 += 1;
            }
        }
        if let Some(previous) = previous {
            for item in previous.items.iter().filter(|i| !i.is_empty_data()) {
                let entry = deltas.entry(item.fingerprint).or_insert((0, item.container_id));
                entry.0 -= 1;
            }
        }
        deltas
    }

    /// A background-replayed block event may only pass the cursor once
    /// every container it references is committed; the chunk entries it
    /// touches become unpinnable and flushable at that point.
    fn ensure_background_replayable(
        &self,
        mappings: &[&dbs_api_types::BlockMapping],
    ) -> Result<(), Error> {
        let mut ids = std::collections::BTreeSet::new();
        for mapping in mappings {
            ids.extend(mapping.referenced_container_ids());
        }
        let check = self.storage.block_mapping_storage_check(ids);
        if !check.open.is_empty() {
            return Err(dbs_oplog::ReplayDeferred.into());
        }
        Ok(())
    }

    fn apply_deltas(
        &self,
        deltas: &HashMap<Fingerprint, (i32, u64)>,
        context: &LogReplayContext,
    ) -> Result<(), Error> {
        for (fingerprint, (delta, container_hint)) in deltas {
            let existing = self.load_value(fingerprint)?;
            let value = match existing {
                Some(value) => value,
                None => {
                    if *delta <= 0 {
                        log::debug!(
                            "usage change for unknown chunk {fingerprint} (log id {})",
                            context.log_id
                        );
                        continue;
                    }
                    if context.mode == ReplayMode::Background {
                        if self.storage.commit_state(*container_hint) != CommitState::Committed {
                            // the write will be failed, never resurrect a
                            // chunk of a dead container
                            continue;
                        }
                        if self.persistent.is_full() {
                            log::warn!("chunk index full, cannot rebuild chunk {fingerprint}");
                            continue;
                        }
                    }
                    // lost dirty entry, rebuilt from the log
                    ChunkValue {
                        container_id: *container_hint,
                        usage_count: 0,
                        usage_count_change_log_id: 0,
                    }
                }
            };

            // idempotency: every entry remembers the log id of its last
            // usage change
            let mut mapping = value.to_mapping(*fingerprint);
            if mapping.usage_count_change_log_id < context.log_id {
                mapping.apply_usage_change(*delta, context.log_id);
            }
            let value = ChunkValue::of_mapping(&mapping);

            match context.mode {
                ReplayMode::Background => {
                    // the cursor passes this event for good: the change
                    // must be durable, and the containers are committed,
                    // so the entry is no longer pinned
                    self.persistent
                        .put(fingerprint.as_bytes(), &encode_value(&value))?;
                    let mut cache = self.cache.lock().unwrap();
                    if cache.contains(fingerprint.as_bytes()) {
                        cache.insert(fingerprint.as_bytes(), value, false, false)?;
                    }
                }
                _ => {
                    let mut cache = self.cache.lock().unwrap();
                    let pinned = cache.is_pinned(fingerprint.as_bytes());
                    let rebuilt = existing.is_none();
                    cache.insert(fingerprint.as_bytes(), value, true, pinned || rebuilt)?;
                }
            }
        }
        if context.mode != ReplayMode::Background {
            self.maybe_flush()?;
        }
        Ok(())
    }

    fn drop_entries_of_failed_container(&self, container_id: u64, keys: &[Fingerprint]) {
        let mut cache = self.cache.lock().unwrap();
        for key in keys {
            let matches = cache
                .value(key.as_bytes())
                .map(|value| value.container_id == container_id)
                .unwrap_or(false);
            if matches {
                cache.remove(key.as_bytes());
            }
        }
    }

    /// End of dirty start: entries still pinned either belong to a
    /// committed container (unpin them) or to one that will never commit
    /// (drop them).
    fn finish_dirty_replay(&self) -> Result<(), Error> {
        let pinned_keys = self.cache.lock().unwrap().pinned_keys();
        for key in pinned_keys {
            let value = match self.cache.lock().unwrap().value(&key) {
                Some(value) => *value,
                None => continue,
            };
            match self.storage.commit_state(value.container_id) {
                CommitState::Committed => {
                    self.cache.lock().unwrap().set_pinned(&key, false);
                }
                _ => {
                    log::info!(
                        "dropping chunk {} of never-committed container {}",
                        hex::encode(&key),
                        value.container_id
                    );
                    self.cache.lock().unwrap().remove(&key);
                }
            }
        }
        self.in_replay.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl LogConsumer for ChunkIndex {
    fn name(&self) -> &'static str {
        "chunk-index"
    }

    fn apply(&self, event: &Event, context: &LogReplayContext) -> Result<(), Error> {
        match event {
            Event::ContainerCommitted { container_id, .. } => {
                if context.mode != ReplayMode::Background {
                    self.tracker.should_process(*container_id)?;
                }
                Ok(())
            }
            Event::ContainerCommitFailed {
                container_id,
                item_keys,
            } => {
                if context.mode != ReplayMode::Background {
                    self.drop_entries_of_failed_container(*container_id, item_keys);
                    self.tracker.processed_container(*container_id)?;
                }
                Ok(())
            }
            Event::BlockMappingWritten { mapping_pair } => {
                if context.mode == ReplayMode::Direct {
                    return Ok(());
                }
                if context.mode == ReplayMode::Background {
                    self.ensure_background_replayable(&[
                        &mapping_pair.updated,
                        &mapping_pair.previous,
                    ])?;
                }
                let deltas = Self::collect_deltas(
                    Some(&mapping_pair.updated),
                    Some(&mapping_pair.previous),
                );
                self.apply_deltas(&deltas, context)?;
                if context.mode == ReplayMode::Background {
                    // replay is past this write, release its GC guards
                    // (one per touch taken on the write path)
                    self.clear_mapping_in_combat(&mapping_pair.updated);
                    self.clear_mapping_in_combat(&mapping_pair.previous);
                }
                Ok(())
            }
            Event::BlockMappingDeleted { original } => {
                if context.mode == ReplayMode::Direct {
                    return Ok(());
                }
                if context.mode == ReplayMode::Background {
                    self.ensure_background_replayable(&[original])?;
                }
                let deltas = Self::collect_deltas(None, Some(original));
                self.apply_deltas(&deltas, context)?;
                if context.mode == ReplayMode::Background {
                    self.clear_mapping_in_combat(original);
                }
                Ok(())
            }
            Event::BlockMappingWriteFailed { mapping_pair, .. } => {
                if context.mode == ReplayMode::Direct {
                    return Ok(());
                }
                // compensate the counts the failed write event applied;
                // never-committed containers are exactly what a failure
                // means, so no replayability check here
                let deltas = Self::collect_deltas(
                    Some(&mapping_pair.previous),
                    Some(&mapping_pair.updated),
                );
                self.apply_deltas(&deltas, context)
            }
            Event::OrphanChunks { fingerprints } => {
                for fingerprint in fingerprints {
                    self.clear_in_combat(fingerprint);
                }
                Ok(())
            }
            Event::ReplayStarted { .. } => {
                if context.mode == ReplayMode::DirtyStart {
                    self.in_replay.store(true, Ordering::SeqCst);
                }
                Ok(())
            }
            Event::ReplayStopped {
                replay_type: ReplayMode::DirtyStart,
                success: true,
            } => self.finish_dirty_replay(),
            _ => Ok(()),
        }
    }
}

impl ChunkGarbage for ChunkIndex {
    fn is_garbage(&self, key: &Fingerprint) -> bool {
        if self.is_in_combat(key) {
            return false;
        }
        {
            let cache = self.cache.lock().unwrap();
            if let Some(entry) = cache.get(key.as_bytes()) {
                return !entry.pinned && !entry.dirty && entry.value.usage_count == 0;
            }
        }
        match self.persistent.get(key.as_bytes()) {
            Ok(Some(data)) => decode_value(&data)
                .map(|value| value.usage_count == 0)
                .unwrap_or(false),
            // unknown chunks stay untouched
            _ => false,
        }
    }

    fn forget(&self, keys: &[Fingerprint]) {
        for key in keys {
            if let Err(err) = self.delete(key) {
                log::error!("unable to drop chunk {key} - {err:#}");
            }
        }
    }
}
