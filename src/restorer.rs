use std::collections::HashMap;

use anyhow::Error;

use dbs_api_types::{ChunkMapping, ErrorContext, Fingerprint};

use crate::engine::Engine;

/// Rebuilds a lost or damaged chunk index from the containers.
///
/// Every committed container's indexed items are inserted with usage count
/// zero, then the persistent block index is walked to recount references
/// (scenario: the index file was cleared or corrupted, the containers and
/// block mappings survived).
pub struct Restorer<'a> {
    engine: &'a Engine,
}

impl<'a> Restorer<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    pub fn restore_chunk_index(&self) -> Result<u64, Error> {
        self.engine.flush()?;

        let chunk_index = self.engine.chunk_index();
        let storage = self.engine.container_storage();

        chunk_index.clear_persistent()?;

        let mut restored = 0u64;
        storage.for_each_primary_container(|container_id| {
            let mut ec = ErrorContext::new();
            let container = storage.read_container(container_id, &mut ec)?;
            for item in container.items() {
                if item.is_deleted || !item.is_indexed {
                    continue;
                }
                let mut mapping = ChunkMapping::new(item.key);
                mapping.container_id = item.original_id;
                chunk_index.put_overwrite(&mapping)?;
                restored += 1;
            }
            Ok(())
        })?;

        // recount references from the surviving block mappings
        let mut counted: HashMap<Fingerprint, i32> = HashMap::new();
        self.engine.block_index().iterate_persistent(|mapping| {
            for item in mapping.items.iter().filter(|i| !i.is_empty_data()) {
                let count = counted.entry(item.fingerprint).or_insert(0);
                if *count < i32::MAX {
                    *count += 1;
                }
            }
            Ok(())
        })?;

        let mut updates = Vec::new();
        chunk_index.iterate_persistent(|mapping| {
            let expected = counted.get(&mapping.fingerprint).copied().unwrap_or(0);
            if mapping.usage_count != expected {
                let mut fixed = mapping;
                fixed.usage_count = expected;
                updates.push(fixed);
            }
            Ok(())
        })?;
        for mapping in updates {
            chunk_index.put_overwrite(&mapping)?;
        }

        log::info!("restored {restored} chunk index entries");
        Ok(restored)
    }
}
