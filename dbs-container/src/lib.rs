//! Container storage.
//!
//! Unique chunk payloads are aggregated into fixed-capacity containers
//! (default 4 MiB) living in large pre-allocated files. Open containers sit
//! in a small write cache until full or aged, then a committer pool writes
//! them out and announces `ContainerCommitted` through the operations log.
//! The meta-data index maps container ids to file coordinates, with one
//! redirection hop for ids absorbed by a merge.

pub mod allocator;
pub mod container;
pub mod gc;
pub mod read_cache;
pub mod storage;
pub mod write_cache;

pub use container::{Container, ContainerItem, CONTAINER_MAGIC_1_0};
pub use gc::{ChunkGarbage, ContainerGc, GcConfig};
pub use storage::{
    CommitState, ContainerStorage, ContainerStorageConfig, GcNotification, StorageCommitCheck,
};
pub use write_cache::OpenContainer;
