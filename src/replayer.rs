use anyhow::Error;

use crate::engine::Engine;

/// Offline log catch-up: drives background replay to the log head so all
/// index deltas are persisted, without taking client traffic.
pub struct Replayer<'a> {
    engine: &'a Engine,
}

impl<'a> Replayer<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }

    pub fn replay(&self) -> Result<u64, Error> {
        let before = self.engine.oplog().pending_count();
        self.engine.flush()?;
        Ok(before)
    }
}
