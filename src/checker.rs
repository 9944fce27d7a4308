use std::collections::HashMap;

use anyhow::Error;

use dbs_api_types::Fingerprint;

use crate::engine::Engine;

/// Result of an offline consistency check.
#[derive(Clone, Debug, Default)]
pub struct CheckReport {
    pub checked_chunks: u64,
    pub usage_errors: u64,
    pub repaired: u64,
    pub skipped_saturated: u64,
}

/// Offline usage-count checker.
///
/// Recomputes, per fingerprint, how many persistent block mapping items
/// reference it and compares against the chunk index. Saturated counters
/// are unverifiable and skipped. Run on a quiesced engine; `run` flushes
/// all deferred work first.
pub struct Checker<'a> {
    engine: &'a Engine,
}

impl<'a> Checker<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    pub fn run(&self, repair: bool) -> Result<CheckReport, Error> {
        self.engine.flush()?;
        self.engine.chunk_index().flush_all_dirty()?;
        self.engine.block_index().flush_aux()?;

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

        let mut report = CheckReport::default();
        let mut repairs = Vec::new();
        self.engine.chunk_index().iterate_persistent(|mapping| {
            report.checked_chunks += 1;
            if mapping.usage_count == i32::MAX {
                report.skipped_saturated += 1;
                return Ok(());
            }
            let expected = counted.get(&mapping.fingerprint).copied().unwrap_or(0);
            if mapping.usage_count != expected {
                log::warn!(
                    "chunk {}: usage count {} differs from {} block references",
                    mapping.fingerprint,
                    mapping.usage_count,
                    expected
                );
                report.usage_errors += 1;
                if repair {
                    let mut fixed = mapping;
                    fixed.usage_count = expected;
                    repairs.push(fixed);
                }
            }
            Ok(())
        })?;

        for mapping in repairs {
            self.engine.chunk_index().put_overwrite(&mapping)?;
            report.repaired += 1;
        }

        log::info!(
            "check finished: {} chunks, {} errors, {} repaired, {} saturated skipped",
            report.checked_chunks,
            report.usage_errors,
            report.repaired,
            report.skipped_saturated
        );
        Ok(report)
    }
}
