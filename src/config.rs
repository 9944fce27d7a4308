use std::time::Duration;

use serde::{Deserialize, Serialize};

use dbs_block_index::BlockIndexConfig;
use dbs_chunk_index::ChunkIndexConfig;
use dbs_container::{ContainerStorageConfig, GcConfig};
use dbs_oplog::OpLogConfig;

/// Engine configuration.
///
/// Every choice is an explicit field; there is no process-global state.
/// The geometry fields (block size, fingerprint size, container size,
/// file layout) are fixed at format time and verified on every open.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EngineConfig {
    pub block_size: u32,
    pub fingerprint_size: usize,

    pub container_size: usize,
    pub container_file_count: u16,
    pub container_slots_per_file: u64,
    pub write_cache_slots: usize,
    pub committer_threads: usize,
    pub write_cache_timeout_secs: u64,
    pub read_cache_lines: usize,
    pub compress: bool,

    pub oplog_size: u64,
    pub sync_commits: bool,

    pub chunk_index_pages: u64,
    pub chunk_cache_capacity: usize,
    /// 0 indexes every fingerprint; n keeps every n-th prefix bucket.
    pub sampling_modulus: u64,
    pub chunk_importer_threads: usize,

    pub block_index_pages: u64,
    pub block_importer_threads: usize,

    pub gc_enabled: bool,
    pub gc_merge_utilization: f64,

    pub file_mode: u32,
    pub dir_mode: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,
            fingerprint_size: 20,
            container_size: 4 * 1024 * 1024,
            container_file_count: 1,
            container_slots_per_file: 1024,
            write_cache_slots: 4,
            committer_threads: 4,
            write_cache_timeout_secs: 30,
            read_cache_lines: 32,
            compress: true,
            oplog_size: 64 * 1024 * 1024,
            sync_commits: true,
            chunk_index_pages: 1024,
            chunk_cache_capacity: 16 * 1024,
            sampling_modulus: 0,
            chunk_importer_threads: 2,
            block_index_pages: 1024,
            block_importer_threads: 2,
            gc_enabled: true,
            gc_merge_utilization: 0.35,
            file_mode: 0o640,
            dir_mode: 0o750,
        }
    }
}

impl EngineConfig {
    pub(crate) fn oplog_config(&self) -> OpLogConfig {
        OpLogConfig {
            size: self.oplog_size,
            sync_commits: self.sync_commits,
            file_mode: self.file_mode,
            ..OpLogConfig::default()
        }
    }

    pub(crate) fn container_config(&self) -> ContainerStorageConfig {
        ContainerStorageConfig {
            container_size: self.container_size,
            file_count: self.container_file_count,
            slots_per_file: self.container_slots_per_file,
            write_cache_slots: self.write_cache_slots,
            committer_threads: self.committer_threads,
            write_cache_timeout: Duration::from_secs(self.write_cache_timeout_secs),
            read_cache_lines: self.read_cache_lines,
            compress: self.compress,
            file_mode: self.file_mode,
            ..ContainerStorageConfig::default()
        }
    }

    pub(crate) fn chunk_config(&self) -> ChunkIndexConfig {
        ChunkIndexConfig {
            fingerprint_size: self.fingerprint_size,
            index_pages: self.chunk_index_pages,
            cache_capacity: self.chunk_cache_capacity,
            file_mode: self.file_mode,
            ..ChunkIndexConfig::default()
        }
    }

    pub(crate) fn block_config(&self) -> BlockIndexConfig {
        BlockIndexConfig {
            block_size: self.block_size,
            fingerprint_size: self.fingerprint_size,
            index_pages: self.block_index_pages,
            file_mode: self.file_mode,
            ..BlockIndexConfig::default()
        }
    }

    pub(crate) fn gc_config(&self) -> GcConfig {
        GcConfig {
            enabled: self.gc_enabled,
            merge_utilization: self.gc_merge_utilization,
            ..GcConfig::default()
        }
    }

    /// The fields fixed at format time.
    pub(crate) fn geometry(&self) -> (u32, usize, usize, u16, u64) {
        (
            self.block_size,
            self.fingerprint_size,
            self.container_size,
            self.container_file_count,
            self.container_slots_per_file,
        )
    }
}
