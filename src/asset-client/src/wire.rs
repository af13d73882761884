use rq_lib::{path, EntryOrigin, FileEntry};
use serde::Deserialize;

pub const NODE_TYPE_FILE: &str = "file";
pub const NODE_TYPE_FOLDER: &str = "folder";

/// One node as the repository reports it. Unknown fields are ignored; the
/// repository sends more than we consume.
#[derive(Debug, Clone, Deserialize)]
pub struct WireEntry {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub size: u64,
    /// Unix-epoch milliseconds.
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub modified: u64,
    #[serde(rename = "checkedOut", default)]
    pub checked_out: bool,
}

impl WireEntry {
    pub fn is_folder(&self) -> bool {
        self.kind == NODE_TYPE_FOLDER
    }

    pub fn into_entry(self, parent: &str) -> FileEntry {
        let tree_path = path::join(parent, &self.name);
        let modified = self.modified;
        let created = if self.created > 0 { self.created } else { modified };
        FileEntry {
            path: tree_path,
            is_directory: self.is_folder(),
            size: if self.is_folder() { 0 } else { self.size },
            created,
            last_modified: modified,
            last_changed: modified,
            last_accessed: modified,
            origin: EntryOrigin::RemoteOnly,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListResponse {
    #[serde(default)]
    pub entries: Vec<WireEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkedAssetsResponse {
    #[serde(default)]
    pub assets: Vec<String>,
}
