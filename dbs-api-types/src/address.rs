use serde::{Deserialize, Serialize};

/// Container id 0 is never allocated; it marks the empty-data address in
/// block mappings.
pub const SENTINEL_CONTAINER_ID: u64 = 0;

/// Location of a container in the meta-data index.
///
/// Every reachable container id resolves, via at most one redirection hop,
/// to a primary entry with file coordinates. The `log_id` is the id of the
/// log event that installed the entry; replay only overwrites an entry with
/// a higher one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum ContainerAddress {
    /// Primary entry with file coordinates.
    Primary {
        file_index: u16,
        file_offset: u64,
        log_id: u64,
    },
    /// Redirection installed for a secondary id after a merge.
    Redirect { primary_id: u64, log_id: u64 },
}

impl ContainerAddress {
    pub fn log_id(&self) -> u64 {
        match self {
            ContainerAddress::Primary { log_id, .. } => *log_id,
            ContainerAddress::Redirect { log_id, .. } => *log_id,
        }
    }

    pub fn with_log_id(self, log_id: u64) -> Self {
        match self {
            ContainerAddress::Primary {
                file_index,
                file_offset,
                ..
            } => ContainerAddress::Primary {
                file_index,
                file_offset,
                log_id,
            },
            ContainerAddress::Redirect { primary_id, .. } => {
                ContainerAddress::Redirect { primary_id, log_id }
            }
        }
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, ContainerAddress::Primary { .. })
    }
}
