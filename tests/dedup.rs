//! Write/read/dedup behavior of the engine.

mod common;

use common::*;

use dedup_blockstore::{Engine, ErrorContext, LookupResult, StopMode};

#[test]
fn write_read_roundtrip() {
    let dir = testdir("roundtrip");
    let engine = Engine::create(&dir, test_config()).unwrap();
    let mut ec = ErrorContext::new();

    let blocks: Vec<Vec<u8>> = (0..4u64).map(|seed| pattern(seed + 1, 64 * 1024)).collect();
    for (block_id, data) in blocks.iter().enumerate() {
        let chunks = chunk_block(data);
        let version = engine
            .write_block(block_id as u64, &as_refs(&chunks), &mut ec)
            .unwrap();
        assert_eq!(version, 1);
    }
    engine.flush().unwrap();

    for (block_id, data) in blocks.iter().enumerate() {
        let read = engine.read_block(block_id as u64, &mut ec).unwrap();
        assert_eq!(&read, data);
    }

    // a block that was never written reads as zeros
    let read = engine.read_block(99, &mut ec).unwrap();
    assert!(read.iter().all(|b| *b == 0));
    assert_eq!(read.len(), 64 * 1024);

    engine.stop(StopMode::WriteBack).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn identical_blocks_deduplicate() {
    let dir = testdir("dedup");
    let engine = Engine::create(&dir, test_config()).unwrap();
    let mut ec = ErrorContext::new();

    let data = pattern(42, 64 * 1024);
    let chunks = chunk_block(&data);

    engine.write_block(0, &as_refs(&chunks), &mut ec).unwrap();
    engine.flush().unwrap();
    engine.chunk_index().flush_all_dirty().unwrap();
    let unique_count = engine.chunk_index().persistent_count();
    assert_eq!(unique_count, chunks.len() as u64);

    // the same contents again, to another block
    engine.write_block(1, &as_refs(&chunks), &mut ec).unwrap();
    engine.flush().unwrap();
    engine.chunk_index().flush_all_dirty().unwrap();
    assert_eq!(engine.chunk_index().persistent_count(), unique_count);

    // every chunk is referenced by both blocks now
    for (fingerprint, _) in &chunks {
        let mut mapping = dedup_blockstore::ChunkMapping::new(*fingerprint);
        assert_eq!(
            engine.chunk_index().lookup(&mut mapping, false).unwrap(),
            LookupResult::Found
        );
        assert_eq!(mapping.usage_count, 2, "chunk {fingerprint}");
    }

    let stats = engine.statistics();
    assert!(stats.chunk_index_hits >= chunks.len() as u64);

    engine.stop(StopMode::WriteBack).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn overwrite_releases_chunks() {
    let dir = testdir("overwrite");
    let engine = Engine::create(&dir, test_config()).unwrap();
    let mut ec = ErrorContext::new();

    let data = pattern(7, 64 * 1024);
    let chunks = chunk_block(&data);
    assert_eq!(engine.write_block(0, &as_refs(&chunks), &mut ec).unwrap(), 1);
    engine.flush().unwrap();

    // zero-fill the block; the chunker maps zero chunks to the empty-data
    // fingerprint
    let zeros = vec![0u8; 64 * 1024];
    let zero_chunks = chunk_block(&zeros);
    assert!(zero_chunks.iter().all(|(fp, _)| fp.is_empty_data()));
    assert_eq!(
        engine.write_block(0, &as_refs(&zero_chunks), &mut ec).unwrap(),
        2
    );
    engine.flush().unwrap();

    assert_eq!(engine.read_block(0, &mut ec).unwrap(), zeros);

    // every chunk of the first write is unreferenced now
    for (fingerprint, _) in &chunks {
        let mut mapping = dedup_blockstore::ChunkMapping::new(*fingerprint);
        assert_eq!(
            engine.chunk_index().lookup(&mut mapping, false).unwrap(),
            LookupResult::Found
        );
        assert_eq!(mapping.usage_count, 0, "chunk {fingerprint}");
    }

    // the empty-data fingerprint never enters the chunk index
    let mut empty = dedup_blockstore::ChunkMapping::new(
        dedup_blockstore::Fingerprint::empty_data(20),
    );
    assert_eq!(
        engine.chunk_index().lookup(&mut empty, false).unwrap(),
        LookupResult::NotFound
    );

    engine.stop(StopMode::WriteBack).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn versions_are_monotonic() {
    let dir = testdir("versions");
    let engine = Engine::create(&dir, test_config()).unwrap();
    let mut ec = ErrorContext::new();

    for round in 1..=5u32 {
        let data = pattern(round as u64, 64 * 1024);
        let chunks = chunk_block(&data);
        let version = engine.write_block(3, &as_refs(&chunks), &mut ec).unwrap();
        assert_eq!(version, round);
    }
    engine.flush().unwrap();

    let (mapping, _) = engine.block_index().read_block_info(3).unwrap();
    assert_eq!(mapping.version, 5);
    assert!(mapping.event_log_id > 0);

    engine.stop(StopMode::WriteBack).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn delete_block_releases_mapping() {
    let dir = testdir("delete");
    let engine = Engine::create(&dir, test_config()).unwrap();
    let mut ec = ErrorContext::new();

    let data = pattern(11, 64 * 1024);
    let chunks = chunk_block(&data);
    engine.write_block(0, &as_refs(&chunks), &mut ec).unwrap();
    engine.flush().unwrap();

    assert!(engine.delete_block(0, &mut ec).unwrap());
    assert!(!engine.delete_block(0, &mut ec).unwrap());
    engine.flush().unwrap();

    let read = engine.read_block(0, &mut ec).unwrap();
    assert!(read.iter().all(|b| *b == 0));

    for (fingerprint, _) in &chunks {
        let mut mapping = dedup_blockstore::ChunkMapping::new(*fingerprint);
        engine.chunk_index().lookup(&mut mapping, false).unwrap();
        assert_eq!(mapping.usage_count, 0);
    }

    engine.stop(StopMode::WriteBack).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}
