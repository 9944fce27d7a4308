//! Crash recovery behavior: dirty starts, failed block writes, shutdown
//! modes.

mod common;

use common::*;

use dedup_blockstore::{
    ChunkMapping, Engine, ErrorContext, LookupResult, Replayer, StopMode,
};

#[test]
fn crash_before_container_commit_fails_the_block_write() {
    let dir = testdir("crash-precommit");
    let mut ec = ErrorContext::new();

    let data = pattern(3, 64 * 1024);
    let chunks = chunk_block(&data);
    {
        let engine = Engine::create(&dir, test_config()).unwrap();
        assert_eq!(engine.write_block(0, &as_refs(&chunks), &mut ec).unwrap(), 1);
        // no flush: the container is still in the write cache when the
        // process dies
        engine.force_stop();
    }

    let engine = Engine::open(&dir, test_config()).unwrap();
    engine.flush().unwrap();

    // the write of block 0, version 1 was marked failed
    let stats = engine.statistics();
    assert!(stats.block_write_failures >= 1);

    // the surviving state for block 0 is the pre-failure one (the empty
    // template, kept under the failing version); the block reads as zeros
    let (mapping, _) = engine.block_index().read_block_info(0).unwrap();
    assert!(mapping.items.iter().all(|item| item.is_empty_data()));
    let read = engine.read_block(0, &mut ec).unwrap();
    assert!(read.iter().all(|b| *b == 0));

    // the lost chunks are gone from the index too
    for (fingerprint, _) in &chunks {
        let mut mapping = ChunkMapping::new(*fingerprint);
        assert_eq!(
            engine.chunk_index().lookup(&mut mapping, false).unwrap(),
            LookupResult::NotFound
        );
    }

    // the block is writable again afterwards, with a fresh version
    let version = engine.write_block(0, &as_refs(&chunks), &mut ec).unwrap();
    assert_eq!(version, 2);
    engine.flush().unwrap();
    assert_eq!(engine.read_block(0, &mut ec).unwrap(), data);

    engine.stop(StopMode::WriteBack).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn crash_after_commit_without_block_write_leaves_orphans() {
    let dir = testdir("crash-orphans");
    let mut ec = ErrorContext::new();

    let data = pattern(5, 64 * 1024);
    let chunks = chunk_block(&data);
    {
        let engine = Engine::create(&dir, test_config()).unwrap();
        // place the chunks without ever writing a block mapping
        for (fingerprint, payload) in &chunks {
            let container_id = engine
                .container_storage()
                .add_chunk(*fingerprint, payload, true, &mut ec)
                .unwrap();
            let mut mapping = ChunkMapping::new(*fingerprint);
            mapping.container_id = container_id;
            engine.chunk_index().put(&mapping, &mut ec).unwrap();
        }
        engine.flush().unwrap();
        engine.chunk_index().flush_all_dirty().unwrap();
        engine.force_stop();
    }

    let engine = Engine::open(&dir, test_config()).unwrap();
    engine.flush().unwrap();

    // the chunks survived the crash with no references
    for (fingerprint, _) in &chunks {
        let mut mapping = ChunkMapping::new(*fingerprint);
        assert_eq!(
            engine.chunk_index().lookup(&mut mapping, false).unwrap(),
            LookupResult::Found,
            "chunk {fingerprint}"
        );
        assert_eq!(mapping.usage_count, 0);
    }
    assert_eq!(engine.block_index().persistent_count(), 0);

    engine.stop(StopMode::WriteBack).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn write_back_stop_and_clean_reopen() {
    let dir = testdir("writeback-stop");
    let mut ec = ErrorContext::new();

    let data = pattern(9, 64 * 1024);
    let chunks = chunk_block(&data);
    {
        let engine = Engine::create(&dir, test_config()).unwrap();
        engine.write_block(4, &as_refs(&chunks), &mut ec).unwrap();
        engine.stop(StopMode::WriteBack).unwrap();
    }

    let engine = Engine::open(&dir, test_config()).unwrap();
    // a clean open must not run a dirty start; the mapping is already
    // persistent
    assert!(engine.block_index().persistent_count() >= 1);
    assert_eq!(engine.read_block(4, &mut ec).unwrap(), data);

    engine.stop(StopMode::WriteBack).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn fast_stop_recovers_from_the_log() {
    let dir = testdir("fast-stop");
    let mut ec = ErrorContext::new();

    let data = pattern(13, 64 * 1024);
    let chunks = chunk_block(&data);
    {
        let engine = Engine::create(&dir, test_config()).unwrap();
        engine.write_block(6, &as_refs(&chunks), &mut ec).unwrap();
        // fast stop commits the data but leaves the index deltas to the
        // log
        engine.stop(StopMode::Fast).unwrap();
    }

    let engine = Engine::open(&dir, test_config()).unwrap();
    engine.flush().unwrap();
    assert_eq!(engine.read_block(6, &mut ec).unwrap(), data);

    for (fingerprint, _) in &chunks {
        let mut mapping = ChunkMapping::new(*fingerprint);
        assert_eq!(
            engine.chunk_index().lookup(&mut mapping, false).unwrap(),
            LookupResult::Found
        );
        assert_eq!(mapping.usage_count, 1);
    }

    engine.stop(StopMode::WriteBack).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn second_instance_is_locked_out() {
    let dir = testdir("locked");
    let engine = Engine::create(&dir, test_config()).unwrap();
    assert!(Engine::open(&dir, test_config()).is_err());
    engine.stop(StopMode::Fast).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn replayer_drives_the_log_to_the_head() {
    let dir = testdir("replayer");
    let mut ec = ErrorContext::new();

    let data = pattern(17, 64 * 1024);
    let chunks = chunk_block(&data);
    {
        let engine = Engine::create(&dir, test_config()).unwrap();
        engine.write_block(2, &as_refs(&chunks), &mut ec).unwrap();
        // the write event cannot be consumed while its container is still
        // open, so the log has a real backlog here
        assert!(engine.oplog().pending_count() > 0);
        // fast stop leaves the index deltas to the log
        engine.stop(StopMode::Fast).unwrap();
    }

    let engine = Engine::open(&dir, test_config()).unwrap();
    Replayer::new(&engine).replay().unwrap();
    assert_eq!(engine.oplog().pending_count(), 0);

    // the replayed deltas are persistent now
    for (fingerprint, _) in &chunks {
        let mut mapping = ChunkMapping::new(*fingerprint);
        assert_eq!(
            engine.chunk_index().lookup(&mut mapping, false).unwrap(),
            LookupResult::Found
        );
        assert_eq!(mapping.usage_count, 1);
    }
    assert_eq!(engine.read_block(2, &mut ec).unwrap(), data);

    engine.stop(StopMode::WriteBack).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn readonly_open_rejects_mutations() {
    let dir = testdir("readonly");
    let mut ec = ErrorContext::new();

    let data = pattern(19, 64 * 1024);
    let chunks = chunk_block(&data);
    {
        let engine = Engine::create(&dir, test_config()).unwrap();
        engine.write_block(3, &as_refs(&chunks), &mut ec).unwrap();
        engine.stop(StopMode::WriteBack).unwrap();
    }

    {
        let engine = Engine::open_readonly(&dir, test_config()).unwrap();
        assert!(engine.is_readonly());
        assert_eq!(engine.read_block(3, &mut ec).unwrap(), data);
        assert!(engine.write_block(4, &as_refs(&chunks), &mut ec).is_err());
        assert!(engine.delete_block(3, &mut ec).is_err());
        engine.stop(StopMode::Fast).unwrap();
    }

    // the read-only instance left the clean-shutdown marker alone: a
    // normal open needs no dirty start and still sees the data
    let engine = Engine::open(&dir, test_config()).unwrap();
    assert!(engine.block_index().persistent_count() >= 1);
    assert_eq!(engine.read_block(3, &mut ec).unwrap(), data);
    engine.stop(StopMode::WriteBack).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn force_open_formats_a_missing_store() {
    let dir = testdir("force");
    let mut ec = ErrorContext::new();
    std::fs::create_dir_all(&dir).unwrap();

    // without force, opening an unformatted directory fails
    assert!(Engine::open(&dir, test_config()).is_err());

    let data = pattern(23, 64 * 1024);
    let chunks = chunk_block(&data);
    {
        let engine = Engine::open_force(&dir, test_config()).unwrap();
        engine.write_block(0, &as_refs(&chunks), &mut ec).unwrap();
        engine.stop(StopMode::WriteBack).unwrap();
    }

    let engine = Engine::open(&dir, test_config()).unwrap();
    assert_eq!(engine.read_block(0, &mut ec).unwrap(), data);
    engine.stop(StopMode::WriteBack).unwrap();
    let _ = std::fs::remove_dir_all(&dir);
}
