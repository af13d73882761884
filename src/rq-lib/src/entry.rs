use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryOrigin {
    RemoteOnly,
    LocalOnly,
    Both,
}

/// Overlay-level view of a file or directory. Materialized on each
/// `open`/`list`, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub is_directory: bool,
    pub size: u64,
    /// Unix-epoch milliseconds.
    pub created: u64,
    pub last_modified: u64,
    pub last_changed: u64,
    pub last_accessed: u64,
    pub origin: EntryOrigin,
}

impl FileEntry {
    pub fn new_file(path: impl Into<String>, size: u64, last_modified: u64) -> Self {
        Self {
            path: path.into(),
            is_directory: false,
            size,
            created: last_modified,
            last_modified,
            last_changed: last_modified,
            last_accessed: last_modified,
            origin: EntryOrigin::RemoteOnly,
        }
    }

    pub fn new_directory(path: impl Into<String>, last_modified: u64) -> Self {
        Self {
            path: path.into(),
            is_directory: true,
            size: 0,
            created: last_modified,
            last_modified,
            last_changed: last_modified,
            last_accessed: last_modified,
            origin: EntryOrigin::RemoteOnly,
        }
    }

    pub fn with_origin(mut self, origin: EntryOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn name(&self) -> &str {
        crate::path::name_of(&self.path)
    }
}

pub fn unix_millis_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn system_time_to_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}
