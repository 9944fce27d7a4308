//! Persistent index primitives.
//!
//! The disk hash index is the shared on-disk map format behind the chunk
//! index, the block index, the failed-writes index and the container
//! meta-data index. The info store keeps small typed records (headers,
//! trackers, statistics snapshots). The write-back cache adds the dirty
//! entry / pinning discipline the chunk index needs on top of a disk hash
//! index.

mod disk_hash;
pub use disk_hash::{DiskHashConfig, DiskHashIndex};

mod info_store;
pub use info_store::InfoStore;

mod write_back;
pub use write_back::{FlushBatch, WriteBackCache, WriteBackEntry};
