use crate::WORK_DIR_NAME;
use log::warn;
use rq_lib::{path, unix_millis_now, RqError, RqResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Sync baseline for one cached content file. A cached file of remote origin
/// without a readable work-file is in conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkFileMeta {
    /// When the local copy was last reconciled with the remote (unix ms).
    pub last_sync: u64,
    /// Remote last-modified observed when the cache was populated (unix ms).
    pub remote_last_modified: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub original_name: Option<String>,
}

impl WorkFileMeta {
    pub fn new(remote_last_modified: u64) -> Self {
        Self {
            last_sync: unix_millis_now(),
            remote_last_modified,
            original_name: None,
        }
    }
}

/// Persists work-files as JSON sidecars under `<parent>/.rq/<name>`,
/// co-located with the cached content they describe.
pub struct WorkFileStore {
    root: PathBuf,
}

impl WorkFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Filesystem location of the sidecar for a logical tree path.
    pub fn work_path(&self, tree_path: &str) -> PathBuf {
        let parent = path::parent_of(tree_path);
        let name = path::name_of(tree_path);
        let mut p = self.root.clone();
        for seg in parent.split('/').filter(|s| !s.is_empty()) {
            p.push(seg);
        }
        p.push(WORK_DIR_NAME);
        p.push(name);
        p
    }

    pub async fn read(&self, tree_path: &str) -> RqResult<Option<WorkFileMeta>> {
        let p = self.work_path(tree_path);
        let data = match fs::read(&p).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&data) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                // A corrupt sidecar is treated like a missing one; the
                // overlay surfaces the conflict on the next list.
                warn!("work file {} is malformed: {}", p.display(), e);
                Ok(None)
            }
        }
    }

    pub async fn has(&self, tree_path: &str) -> bool {
        fs::metadata(self.work_path(tree_path)).await.is_ok()
    }

    /// Atomic write: sidecars are read concurrently by list sweeps, so a
    /// half-written file must never be observable.
    pub async fn write(&self, tree_path: &str, meta: &WorkFileMeta) -> RqResult<()> {
        let p = self.work_path(tree_path);
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file_name = p
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let tmp = p.with_file_name(format!("{}.tmp", file_name));
        let data = serde_json::to_vec(meta)
            .map_err(|e| RqError::Internal(format!("encode work file: {}", e)))?;
        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &p).await?;
        Ok(())
    }

    /// Marks the path as reconciled now, adopting `local_last_modified` as
    /// the new remote baseline. Preserves rename tracking.
    pub async fn refresh(&self, tree_path: &str, local_last_modified: u64) -> RqResult<()> {
        let original_name = match self.read(tree_path).await? {
            Some(meta) => meta.original_name,
            None => None,
        };
        let meta = WorkFileMeta {
            last_sync: unix_millis_now(),
            remote_last_modified: local_last_modified,
            original_name,
        };
        self.write(tree_path, &meta).await
    }

    pub async fn remove(&self, tree_path: &str) -> RqResult<()> {
        match fs::remove_file(self.work_path(tree_path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Moves the sidecar along with its content file, recording the original
    /// name the first time the file is renamed.
    pub async fn rename(&self, from: &str, to: &str) -> RqResult<()> {
        let Some(mut meta) = self.read(from).await? else {
            return Ok(());
        };
        if meta.original_name.is_none() {
            meta.original_name = Some(path::name_of(from).to_string());
        }
        self.write(to, &meta).await?;
        self.remove(from).await
    }

    /// Removes an orphaned sidecar directory once its folder has no cached
    /// content left.
    pub async fn remove_dir(&self, tree_parent: &str) -> RqResult<()> {
        let mut p = self.root.clone();
        for seg in tree_parent.split('/').filter(|s| !s.is_empty()) {
            p.push(seg);
        }
        p.push(WORK_DIR_NAME);
        match fs::remove_dir_all(&p).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
