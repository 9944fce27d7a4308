use serde::{Deserialize, Serialize};

use dbs_api_types::{BlockMapping, BlockMappingPair, ContainerAddress, Fingerprint};

/// How an event reaches a consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplayMode {
    /// Synchronously from inside `commit_event`, after the record is
    /// durable. In-memory state updates only.
    Direct,
    /// At startup after an unclean stop, to rebuild in-memory state.
    DirtyStart,
    /// From the continuous low-priority worker doing persistence work.
    Background,
}

/// Passed to every consumer along with the event.
#[derive(Clone, Copy, Debug)]
pub struct LogReplayContext {
    pub log_id: u64,
    pub mode: ReplayMode,
}

/// The closed set of log events.
///
/// Synthetic events (`ReplayStarted`, `ReplayStopped`, `LogEmpty`) are
/// dispatched but never written to the ring.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum Event {
    ContainerOpened {
        container_id: u64,
        address: ContainerAddress,
    },
    ContainerCommitted {
        container_id: u64,
        address: ContainerAddress,
        item_count: u32,
        active_data_size: u64,
    },
    ContainerCommitFailed {
        container_id: u64,
        item_keys: Vec<Fingerprint>,
    },
    ContainerMoved {
        container_id: u64,
        old_address: ContainerAddress,
        new_address: ContainerAddress,
        old_item_count: u32,
        item_count: u32,
        old_active_data_size: u64,
        active_data_size: u64,
    },
    ContainerMerged {
        first_id: u64,
        second_id: u64,
        first_secondary_ids: Vec<u64>,
        second_secondary_ids: Vec<u64>,
        new_primary_id: u64,
        new_secondary_ids: Vec<u64>,
        new_address: ContainerAddress,
        unused_ids: Vec<u64>,
        new_item_count: u32,
        new_active_data_size: u64,
    },
    ContainerDeleted {
        container_id: u64,
        secondary_container_ids: Vec<u64>,
        address: ContainerAddress,
    },
    BlockMappingWritten {
        mapping_pair: BlockMappingPair,
    },
    BlockMappingDeleted {
        original: BlockMapping,
    },
    BlockMappingWriteFailed {
        mapping_pair: BlockMappingPair,
        write_event_log_id: Option<u64>,
    },
    OrphanChunks {
        fingerprints: Vec<Fingerprint>,
    },
    ReplayStarted {
        full_log_replay: bool,
    },
    ReplayStopped {
        replay_type: ReplayMode,
        success: bool,
    },
    LogEmpty,
}

impl Event {
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::ContainerOpened { .. } => "container-opened",
            Event::ContainerCommitted { .. } => "container-committed",
            Event::ContainerCommitFailed { .. } => "container-commit-failed",
            Event::ContainerMoved { .. } => "container-moved",
            Event::ContainerMerged { .. } => "container-merged",
            Event::ContainerDeleted { .. } => "container-deleted",
            Event::BlockMappingWritten { .. } => "block-mapping-written",
            Event::BlockMappingDeleted { .. } => "block-mapping-deleted",
            Event::BlockMappingWriteFailed { .. } => "block-mapping-write-failed",
            Event::OrphanChunks { .. } => "orphan-chunks",
            Event::ReplayStarted { .. } => "replay-started",
            Event::ReplayStopped { .. } => "replay-stopped",
            Event::LogEmpty => "log-empty",
        }
    }

    /// Synthetic events are dispatched only, never persisted.
    pub fn is_synthetic(&self) -> bool {
        matches!(
            self,
            Event::ReplayStarted { .. } | Event::ReplayStopped { .. } | Event::LogEmpty
        )
    }
}

/// A subsystem consuming log events.
///
/// Consumers MUST be idempotent under replay: the same event can arrive in
/// `Direct` mode first and in `DirtyStart` or `Background` mode later.
/// Handlers must not commit new events; deferred work belongs on the
/// subsystem's own background thread.
pub trait LogConsumer: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, event: &Event, context: &LogReplayContext) -> Result<(), anyhow::Error>;
}
