use std::collections::BTreeSet;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

use crate::{Fingerprint, SENTINEL_CONTAINER_ID};

/// One chunk reference inside a block mapping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMappingItem {
    pub fingerprint: Fingerprint,
    /// Container id the chunk payload lives in (possibly via redirection).
    pub container_id: u64,
    /// Offset of the referenced range inside the chunk payload.
    pub chunk_offset: u32,
    pub chunk_size: u32,
}

impl BlockMappingItem {
    /// Padding item covering `size` bytes of unwritten data.
    pub fn empty_data(fingerprint_size: usize, size: u32) -> Self {
        Self {
            fingerprint: Fingerprint::empty_data(fingerprint_size),
            container_id: SENTINEL_CONTAINER_ID,
            chunk_offset: 0,
            chunk_size: size,
        }
    }

    pub fn is_empty_data(&self) -> bool {
        self.container_id == SENTINEL_CONTAINER_ID
    }
}

/// Ordered chunk list for one logical block.
///
/// `version` 0 is the empty template of a block that was never written; the
/// first successful write persists version 1. The summed `chunk_size` of the
/// items always equals `block_size`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMapping {
    pub block_id: u64,
    pub version: u32,
    pub block_size: u32,
    pub items: Vec<BlockMappingItem>,
    /// Log id of the write event, set at persistence time.
    pub event_log_id: u64,
}

impl BlockMapping {
    /// The mapping of a block nothing was ever written to.
    pub fn empty_template(block_id: u64, block_size: u32, fingerprint_size: usize) -> Self {
        Self {
            block_id,
            version: 0,
            block_size,
            items: vec![BlockMappingItem::empty_data(fingerprint_size, block_size)],
            event_log_id: 0,
        }
    }

    pub fn is_empty_template(&self) -> bool {
        self.version == 0
    }

    pub fn check_size(&self) -> Result<(), Error> {
        let total: u64 = self.items.iter().map(|i| i.chunk_size as u64).sum();
        if total != self.block_size as u64 {
            bail!(
                "block {} mapping covers {} bytes, block size is {}",
                self.block_id,
                total,
                self.block_size
            );
        }
        Ok(())
    }

    /// Container ids referenced by the mapping, without the sentinel.
    pub fn referenced_container_ids(&self) -> BTreeSet<u64> {
        self.items
            .iter()
            .filter(|item| !item.is_empty_data())
            .map(|item| item.container_id)
            .collect()
    }
}

/// Compact previous/updated delta carried by block mapping log events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMappingPair {
    pub previous: BlockMapping,
    pub updated: BlockMapping,
}

impl BlockMappingPair {
    pub fn new(previous: BlockMapping, updated: BlockMapping) -> Result<Self, Error> {
        if previous.block_id != updated.block_id {
            bail!(
                "mapping pair mixes blocks {} and {}",
                previous.block_id,
                updated.block_id
            );
        }
        if updated.version != previous.version + 1 {
            bail!(
                "block {} version step {} -> {}",
                previous.block_id,
                previous.version,
                updated.version
            );
        }
        Ok(Self { previous, updated })
    }

    pub fn block_id(&self) -> u64 {
        self.updated.block_id
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_template_covers_block() {
        let mapping = BlockMapping::empty_template(5, 64 * 1024, 20);
        mapping.check_size().unwrap();
        assert!(mapping.is_empty_template());
        assert!(mapping.referenced_container_ids().is_empty());
    }

    #[test]
    fn pair_rejects_version_gaps() {
        let previous = BlockMapping::empty_template(1, 4096, 20);
        let mut updated = previous.clone();
        updated.version = 2;
        assert!(BlockMappingPair::new(previous.clone(), updated).is_err());

        let mut updated = previous.clone();
        updated.version = 1;
        let pair = BlockMappingPair::new(previous, updated).unwrap();
        assert_eq!(pair.block_id(), 1);
    }
}
