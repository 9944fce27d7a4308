//! Shared helpers for the engine integration tests.
//!
//! The external chunking pipeline is out of scope for the engine, so the
//! tests stand in for it: fixed 8 KiB chunks, SHA-1 fingerprints, all-zero
//! chunks mapped to the empty-data fingerprint the way the filter chain
//! would.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use dedup_blockstore::{EngineConfig, Fingerprint};

pub const TEST_CHUNK_SIZE: usize = 8 * 1024;

static DIR_SEQ: AtomicU32 = AtomicU32::new(0);

pub fn testdir(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!(
        "dbs-engine-{}-{}-{}",
        name,
        std::process::id(),
        DIR_SEQ.fetch_add(1, Ordering::SeqCst)
    ));
    let _ = std::fs::remove_dir_all(&path);
    path
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        block_size: 64 * 1024,
        container_size: 256 * 1024,
        container_file_count: 1,
        container_slots_per_file: 64,
        write_cache_slots: 2,
        committer_threads: 2,
        // commits are driven by the tests via flush()
        write_cache_timeout_secs: 3600,
        oplog_size: 4 * 1024 * 1024,
        sync_commits: false,
        chunk_index_pages: 128,
        chunk_cache_capacity: 4096,
        block_index_pages: 128,
        // GC cycles are driven explicitly
        gc_enabled: false,
        ..EngineConfig::default()
    }
}

pub fn fingerprint_of(data: &[u8]) -> Fingerprint {
    Fingerprint::new(&openssl::sha::sha1(data)).unwrap()
}

/// Deterministic pseudo-random block contents.
pub fn pattern(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9e3779b97f4a7c15) | 1;
    let mut data = Vec::with_capacity(len);
    while data.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        data.extend_from_slice(&state.to_le_bytes());
    }
    data.truncate(len);
    data
}

/// What the external chunker/filter pipeline would hand the engine.
pub fn chunk_block(data: &[u8]) -> Vec<(Fingerprint, Vec<u8>)> {
    data.chunks(TEST_CHUNK_SIZE)
        .map(|chunk| {
            if chunk.iter().all(|b| *b == 0) {
                (Fingerprint::empty_data(20), chunk.to_vec())
            } else {
                (fingerprint_of(chunk), chunk.to_vec())
            }
        })
        .collect()
}

pub fn as_refs(chunks: &[(Fingerprint, Vec<u8>)]) -> Vec<(Fingerprint, &[u8])> {
    chunks
        .iter()
        .map(|(fp, data)| (*fp, data.as_slice()))
        .collect()
}
