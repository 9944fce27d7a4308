use bitflags::bitflags;

bitflags! {
    /// Failure classification collected along a request path.
    ///
    /// The front-end maps these to transport status codes; the engine only
    /// sets them.
    pub struct ErrorFlags: u32 {
        /// No capacity for a new block id, fingerprint or container slot.
        const FULL          = 0x0001;
        /// The operations log ran out of ring space.
        const LOG_FULL      = 0x0002;
        /// A file read/write or sync failed.
        const IO            = 0x0004;
        /// CRC mismatch, deserialization failure or invariant violation.
        const INTEGRITY     = 0x0008;
        /// A container could not be written.
        const COMMIT_FAILED = 0x0010;
        /// A try-lock lost a contest; retry later.
        const ABORTED       = 0x0020;
        /// A lookup found nothing (not an error per se).
        const NOT_FOUND     = 0x0040;
    }
}

/// Accumulator threaded through write paths.
#[derive(Clone, Debug)]
pub struct ErrorContext {
    flags: ErrorFlags,
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self {
            flags: ErrorFlags::empty(),
        }
    }
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, flags: ErrorFlags) {
        self.flags |= flags;
    }

    pub fn contains(&self, flags: ErrorFlags) -> bool {
        self.flags.contains(flags)
    }

    pub fn flags(&self) -> ErrorFlags {
        self.flags
    }

    pub fn merge(&mut self, other: &ErrorContext) {
        self.flags |= other.flags;
    }
}

/// Result of an index or cache lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupResult {
    Found,
    NotFound,
}

impl LookupResult {
    pub fn is_found(&self) -> bool {
        matches!(self, LookupResult::Found)
    }
}
