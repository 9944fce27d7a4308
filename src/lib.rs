//! Block-level inline deduplicating storage engine.
//!
//! Incoming block writes arrive as streams of (fingerprint, payload)
//! chunks produced by an external content-defined chunker. Unique chunk
//! payloads are aggregated into large container objects, the chunk index
//! maps fingerprints to containers, the block index maps block ids to
//! ordered chunk lists, and the operations log sequences every metadata
//! mutation so a crash at any point is recoverable.
//!
//! The [`Engine`] wires the subsystems together; the individual crates
//! (`dbs-oplog`, `dbs-container`, `dbs-chunk-index`, `dbs-block-index`)
//! carry the mechanics.

pub mod config;
pub mod engine;

mod checker;
mod replayer;
mod restorer;

pub use checker::{CheckReport, Checker};
pub use config::EngineConfig;
pub use engine::{Engine, StatisticsSnapshot};
pub use replayer::Replayer;
pub use restorer::Restorer;

pub use dbs_api_types::{
    BlockMapping, BlockMappingItem, BlockMappingPair, ChunkMapping, ContainerAddress,
    ErrorContext, ErrorFlags, Fingerprint, LookupResult, StopMode, SystemState,
};
