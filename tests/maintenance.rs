//! Garbage collection, merge, checker and restorer behavior.

mod common;

use common::*;

use dedup_blockstore::{
    Checker, ChunkMapping, ContainerAddress, Engine, ErrorContext, LookupResult, Restorer,
    StopMode,
};

#[test]
fn merge_keeps_chunks_readable_via_redirection() {
    let dir = testdir("merge");
    let engine = Engine::create(&dir, test_config()).unwrap();
    let mut ec = ErrorContext::new();

    // two sparse containers, one per flushed block
    let first = pattern(21, 64 * 1024);
    let second = pattern(22, 64 * 1024);
    engine
        .write_block(0, &as_refs(&chunk_block(&first)), &mut ec)
        .unwrap();
    engine.flush().unwrap();
    engine
        .write_block(1, &as_refs(&chunk_block(&second)), &mut ec)
        .unwrap();
    engine.flush().unwrap();
    engine.chunk_index().flush_all_dirty().unwrap();

    let storage = engine.container_storage();
    assert!(storage.lookup_address(1).unwrap().unwrap().is_primary());
    assert!(storage.lookup_address(2).unwrap().unwrap().is_primary());
    let free_before = storage.free_slots();

    engine.gc().run_once().unwrap();
    assert_eq!(engine.statistics().container_merges, 1);

    // the larger input id survives as primary, the other redirects to it
    match storage.lookup_address(1).unwrap().unwrap() {
        ContainerAddress::Redirect { primary_id, .. } => assert_eq!(primary_id, 2),
        other => panic!("expected a redirection, got {other:?}"),
    }
    assert!(storage.lookup_address(2).unwrap().unwrap().is_primary());

    // two slots freed, one new slot taken
    assert_eq!(storage.free_slots(), free_before + 1);

    // every chunk stays readable through its old container id
    assert_eq!(engine.read_block(0, &mut ec).unwrap(), first);
    assert_eq!(engine.read_block(1, &mut ec).unwrap(), second);
    for (fingerprint, payload) in chunk_block(&first) {
        let mut mapping = ChunkMapping::new(fingerprint);
        assert_eq!(
            engine.chunk_index().lookup(&mut mapping, false).unwrap(),
            LookupResult::Found
        );
        let read = storage
            .read_chunk(mapping.container_id, &fingerprint, &mut ec)
            .unwrap()
            .unwrap();
        assert_eq!(read, payload);
    }

    engine.stop(StopMode::WriteBack).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn gc_reclaims_overwritten_chunks() {
    let dir = testdir("gc-reclaim");
    let engine = Engine::create(&dir, test_config()).unwrap();
    let mut ec = ErrorContext::new();

    let data = pattern(31, 64 * 1024);
    let chunks = chunk_block(&data);
    engine.write_block(0, &as_refs(&chunks), &mut ec).unwrap();
    engine.flush().unwrap();

    // overwrite with zeros: every chunk of the first write drops to
    // usage count 0
    let zeros = vec![0u8; 64 * 1024];
    engine
        .write_block(0, &as_refs(&chunk_block(&zeros)), &mut ec)
        .unwrap();
    engine.flush().unwrap();
    engine.chunk_index().flush_all_dirty().unwrap();

    let storage = engine.container_storage();
    let total_slots = storage.free_slots() + 1; // one container holds the dead chunks

    // first cycle compacts the garbage away, the second deletes the
    // empty container
    engine.gc().run_once().unwrap();
    engine.gc().run_once().unwrap();

    assert_eq!(storage.free_slots(), total_slots);
    for (fingerprint, _) in &chunks {
        let mut mapping = ChunkMapping::new(*fingerprint);
        assert_eq!(
            engine.chunk_index().lookup(&mut mapping, false).unwrap(),
            LookupResult::NotFound,
            "chunk {fingerprint} should be collected"
        );
    }

    // the zero-filled block still reads correctly
    assert_eq!(engine.read_block(0, &mut ec).unwrap(), zeros);

    engine.stop(StopMode::WriteBack).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn restorer_rebuilds_a_cleared_chunk_index() {
    let dir = testdir("restore");
    let engine = Engine::create(&dir, test_config()).unwrap();
    let mut ec = ErrorContext::new();

    let blocks: Vec<Vec<u8>> = (0..2u64).map(|seed| pattern(seed + 51, 64 * 1024)).collect();
    for (block_id, data) in blocks.iter().enumerate() {
        engine
            .write_block(block_id as u64, &as_refs(&chunk_block(data)), &mut ec)
            .unwrap();
    }
    engine.flush().unwrap();
    engine.chunk_index().flush_all_dirty().unwrap();
    let count_before = engine.chunk_index().persistent_count();
    assert!(count_before > 0);

    let restored = Restorer::new(&engine).restore_chunk_index().unwrap();
    assert_eq!(restored, count_before);
    assert_eq!(engine.chunk_index().persistent_count(), count_before);

    // every fingerprint resolves again, with recounted references
    for data in &blocks {
        for (fingerprint, payload) in chunk_block(data) {
            let mut mapping = ChunkMapping::new(fingerprint);
            assert_eq!(
                engine.chunk_index().lookup(&mut mapping, false).unwrap(),
                LookupResult::Found
            );
            assert_eq!(mapping.usage_count, 1);
            let read = engine
                .container_storage()
                .read_chunk(mapping.container_id, &fingerprint, &mut ec)
                .unwrap()
                .unwrap();
            assert_eq!(read, payload);
        }
    }

    engine.stop(StopMode::WriteBack).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn checker_repairs_diverged_usage_counts() {
    let dir = testdir("check");
    let engine = Engine::create(&dir, test_config()).unwrap();
    let mut ec = ErrorContext::new();

    let data = pattern(61, 64 * 1024);
    let chunks = chunk_block(&data);
    engine.write_block(0, &as_refs(&chunks), &mut ec).unwrap();
    engine.flush().unwrap();
    engine.chunk_index().flush_all_dirty().unwrap();

    // sabotage one usage count
    let mut mapping = ChunkMapping::new(chunks[0].0);
    engine.chunk_index().lookup(&mut mapping, false).unwrap();
    mapping.usage_count = 5;
    engine.chunk_index().put_overwrite(&mapping).unwrap();

    let report = Checker::new(&engine).run(true).unwrap();
    assert_eq!(report.usage_errors, 1);
    assert_eq!(report.repaired, 1);
    assert_eq!(report.checked_chunks, chunks.len() as u64);

    let report = Checker::new(&engine).run(true).unwrap();
    assert_eq!(report.usage_errors, 0);

    let mut repaired = ChunkMapping::new(chunks[0].0);
    engine.chunk_index().lookup(&mut repaired, false).unwrap();
    assert_eq!(repaired.usage_count, 1);

    engine.stop(StopMode::WriteBack).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn saturated_counters_are_left_alone() {
    let dir = testdir("saturated");
    let engine = Engine::create(&dir, test_config()).unwrap();
    let mut ec = ErrorContext::new();

    let data = pattern(71, 64 * 1024);
    let chunks = chunk_block(&data);
    engine.write_block(0, &as_refs(&chunks), &mut ec).unwrap();
    engine.flush().unwrap();
    engine.chunk_index().flush_all_dirty().unwrap();

    // a saturated counter is unverifiable and must survive the check
    let mut mapping = ChunkMapping::new(chunks[0].0);
    engine.chunk_index().lookup(&mut mapping, false).unwrap();
    mapping.usage_count = i32::MAX;
    engine.chunk_index().put_overwrite(&mapping).unwrap();

    let report = Checker::new(&engine).run(true).unwrap();
    assert_eq!(report.skipped_saturated, 1);
    assert_eq!(report.usage_errors, 0);

    let mut after = ChunkMapping::new(chunks[0].0);
    engine.chunk_index().lookup(&mut after, false).unwrap();
    assert_eq!(after.usage_count, i32::MAX);

    engine.stop(StopMode::WriteBack).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}
