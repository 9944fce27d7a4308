use serde::{Deserialize, Serialize};

use crate::Fingerprint;

/// Chunk index entry for a single fingerprint.
///
/// `usage_count` counts the block mapping items referencing the chunk. It
/// saturates at `i32::MAX`; a saturated counter is kept as-is and treated as
/// unverifiable by the offline checker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMapping {
    pub fingerprint: Fingerprint,
    pub container_id: u64,
    pub usage_count: i32,
    pub usage_count_change_log_id: u64,
}

impl ChunkMapping {
    pub fn new(fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            container_id: 0,
            usage_count: 0,
            usage_count_change_log_id: 0,
        }
    }

    /// Apply a usage count delta recorded by log event `log_id`.
    ///
    /// Saturated counters stay saturated, counts never drop below zero.
    pub fn apply_usage_change(&mut self, delta: i32, log_id: u64) {
        if self.usage_count != i32::MAX {
            self.usage_count = self.usage_count.saturating_add(delta).max(0);
        }
        self.usage_count_change_log_id = log_id;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn usage_count_saturates_and_floors() {
        let mut mapping = ChunkMapping::new(Fingerprint::new(&[1u8; 20]).unwrap());

        mapping.apply_usage_change(1, 7);
        assert_eq!(mapping.usage_count, 1);
        assert_eq!(mapping.usage_count_change_log_id, 7);

        mapping.apply_usage_change(-5, 8);
        assert_eq!(mapping.usage_count, 0);

        mapping.usage_count = i32::MAX;
        mapping.apply_usage_change(1, 9);
        assert_eq!(mapping.usage_count, i32::MAX);
        mapping.apply_usage_change(-1, 10);
        assert_eq!(mapping.usage_count, i32::MAX);
    }
}
