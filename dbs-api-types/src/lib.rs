//! Shared data model of the dedup blockstore.
//!
//! Plain data types passed between the container storage, the chunk index,
//! the block index and the operations log. No I/O happens here.

mod fingerprint;
pub use fingerprint::{Fingerprint, DEFAULT_FINGERPRINT_SIZE, MAX_FINGERPRINT_SIZE};

mod address;
pub use address::{ContainerAddress, SENTINEL_CONTAINER_ID};

mod chunk;
pub use chunk::ChunkMapping;

mod block;
pub use block::{BlockMapping, BlockMappingItem, BlockMappingPair};

mod error;
pub use error::{ErrorContext, ErrorFlags, LookupResult};

mod lifecycle;
pub use lifecycle::{CreateMode, DirtyMode, ForceMode, StartContext, StopMode, SystemState};
