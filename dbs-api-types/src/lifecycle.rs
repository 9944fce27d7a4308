use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CreateMode {
    /// Format new on-disk state; fails if state already exists.
    Create,
    /// Open pre-existing state; fails if nothing exists.
    NonCreate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DirtyMode {
    Clean,
    Dirty,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForceMode {
    NoForce,
    Force,
}

/// How each subsystem is started.
#[derive(Clone, Debug)]
pub struct StartContext {
    pub create: CreateMode,
    pub dirty: DirtyMode,
    pub force: ForceMode,
    pub has_crashed: bool,
    pub readonly: bool,
    pub file_mode: u32,
    pub dir_mode: u32,
}

impl StartContext {
    pub fn create() -> Self {
        Self {
            create: CreateMode::Create,
            dirty: DirtyMode::Clean,
            force: ForceMode::NoForce,
            has_crashed: false,
            readonly: false,
            file_mode: 0o640,
            dir_mode: 0o750,
        }
    }

    pub fn open(dirty: DirtyMode, has_crashed: bool) -> Self {
        Self {
            create: CreateMode::NonCreate,
            dirty,
            force: ForceMode::NoForce,
            has_crashed,
            readonly: false,
            file_mode: 0o640,
            dir_mode: 0o750,
        }
    }

    pub fn is_create(&self) -> bool {
        self.create == CreateMode::Create
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty == DirtyMode::Dirty
    }
}

/// Engine lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SystemState {
    Created,
    Starting,
    DirtyReplay,
    Started,
    Running,
    Stopped,
}

/// Graceful shutdown flavor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopMode {
    /// Persist what is easy, drop what is hard, mark clean.
    Fast,
    /// Flush auxiliary indexes, dirty chunk pages and open containers.
    WriteBack,
}
