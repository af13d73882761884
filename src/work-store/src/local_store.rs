use crate::WORK_DIR_NAME;
use async_trait::async_trait;
use log::warn;
use rq_lib::{
    path, system_time_to_millis, ByteReader, EntryOrigin, FileEntry, LocalBackend, RqError,
    RqResult,
};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, SeekFrom};

/// Local content cache over a root directory. Logical tree paths map 1:1
/// onto the directory layout; `.rq` sidecar directories are invisible.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn fs_path(&self, tree_path: &str) -> PathBuf {
        let mut p = self.root.clone();
        for seg in tree_path.split('/').filter(|s| !s.is_empty()) {
            p.push(seg);
        }
        p
    }

    fn entry_from_metadata(&self, tree_path: &str, meta: &std::fs::Metadata) -> FileEntry {
        let modified = meta
            .modified()
            .map(system_time_to_millis)
            .unwrap_or_default();
        let created = meta
            .created()
            .map(system_time_to_millis)
            .unwrap_or(modified);
        let accessed = meta
            .accessed()
            .map(system_time_to_millis)
            .unwrap_or(modified);
        FileEntry {
            path: tree_path.to_string(),
            is_directory: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            created,
            last_modified: modified,
            last_changed: modified,
            last_accessed: accessed,
            origin: EntryOrigin::LocalOnly,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl LocalBackend for LocalStore {
    async fn stat(&self, tree_path: &str) -> RqResult<FileEntry> {
        let meta = fs::metadata(self.fs_path(tree_path)).await?;
        Ok(self.entry_from_metadata(tree_path, &meta))
    }

    async fn exists(&self, tree_path: &str) -> RqResult<bool> {
        Ok(fs::metadata(self.fs_path(tree_path)).await.is_ok())
    }

    async fn list(&self, parent: &str) -> RqResult<Vec<FileEntry>> {
        let dir = self.fs_path(parent);
        let mut entries = Vec::new();
        let mut rd = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };
        while let Some(item) = rd.next_entry().await? {
            let name = item.file_name().to_string_lossy().to_string();
            if name == WORK_DIR_NAME {
                continue;
            }
            let meta = match item.metadata().await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!("stat {} failed during list: {}", name, e);
                    continue;
                }
            };
            let tree_path = path::join(parent, &name);
            entries.push(self.entry_from_metadata(&tree_path, &meta));
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn open(&self, tree_path: &str) -> RqResult<ByteReader> {
        let file = File::open(self.fs_path(tree_path)).await?;
        Ok(Box::pin(file))
    }

    async fn open_at(&self, tree_path: &str, offset: u64) -> RqResult<ByteReader> {
        let mut file = File::open(self.fs_path(tree_path)).await?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
        }
        Ok(Box::pin(file))
    }

    async fn write_file(&self, tree_path: &str, data: &[u8]) -> RqResult<()> {
        let p = self.fs_path(tree_path);
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&p, data).await?;
        Ok(())
    }

    async fn create_directory(&self, tree_path: &str) -> RqResult<()> {
        fs::create_dir_all(self.fs_path(tree_path)).await?;
        Ok(())
    }

    async fn remove_file(&self, tree_path: &str) -> RqResult<()> {
        fs::remove_file(self.fs_path(tree_path)).await?;
        Ok(())
    }

    async fn remove_directory(&self, tree_path: &str) -> RqResult<()> {
        fs::remove_dir_all(self.fs_path(tree_path)).await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> RqResult<()> {
        let dst = self.fs_path(to);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(self.fs_path(from), dst).await?;
        Ok(())
    }

    async fn download(&self, tree_path: &str, mut reader: ByteReader) -> RqResult<u64> {
        let p = self.fs_path(tree_path);
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Stream into the hidden sidecar directory first; a failed or
        // in-flight fetch must never be visible as content.
        let name = path::name_of(tree_path);
        let tmp = p
            .parent()
            .map(|parent| parent.join(WORK_DIR_NAME))
            .unwrap_or_else(|| self.root.join(WORK_DIR_NAME))
            .join(format!("{}.download", name));
        if let Some(parent) = tmp.parent() {
            fs::create_dir_all(parent).await?;
        }
        let result = async {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .await?;
            let copied = tokio::io::copy(&mut reader, &mut file).await?;
            file.sync_all().await?;
            Ok::<u64, RqError>(copied)
        }
        .await;

        match result {
            Ok(copied) => {
                fs::rename(&tmp, &p).await?;
                Ok(copied)
            }
            Err(e) => {
                if let Err(rm) = fs::remove_file(&tmp).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!("cleanup of partial download {} failed: {}", tmp.display(), rm);
                    }
                }
                Err(e)
            }
        }
    }

    fn content_path(&self, tree_path: &str) -> PathBuf {
        self.fs_path(tree_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_write_stat_open() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store.write_file("/docs/a.txt", b"hello").await.unwrap();

        let entry = store.stat("/docs/a.txt").await.unwrap();
        assert_eq!(entry.size, 5);
        assert!(!entry.is_directory);
        assert_eq!(entry.origin, EntryOrigin::LocalOnly);

        let mut reader = store.open("/docs/a.txt").await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
    }

    #[tokio::test]
    async fn test_open_at_offset() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store.write_file("/f", b"0123456789").await.unwrap();
        let mut reader = store.open_at("/f", 6).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"6789");
    }

    #[tokio::test]
    async fn test_list_skips_work_dir() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store.write_file("/a/x.txt", b"x").await.unwrap();
        store.write_file("/a/.rq/x.txt", b"{}").await.unwrap();
        store.create_directory("/a/sub").await.unwrap();

        let entries = store.list("/a").await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["sub", "x.txt"]);
    }

    #[tokio::test]
    async fn test_list_missing_parent_is_empty() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        assert!(store.list("/nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_creates_destination_parent() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store.write_file("/a/f", b"data").await.unwrap();
        store.rename("/a/f", "/b/c/g").await.unwrap();
        assert!(!store.exists("/a/f").await.unwrap());
        assert_eq!(store.stat("/b/c/g").await.unwrap().size, 4);
    }

    #[tokio::test]
    async fn test_download_streams_to_file() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let reader: ByteReader = Box::pin(std::io::Cursor::new(b"remote bytes".to_vec()));
        let copied = store.download("/d/f.bin", reader).await.unwrap();
        assert_eq!(copied, 12);
        assert_eq!(store.stat("/d/f.bin").await.unwrap().size, 12);
        // No temp litter left behind.
        let entries = store.list("/d").await.unwrap();
        assert_eq!(entries.len(), 1);
    }
}
