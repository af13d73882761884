use async_trait::async_trait;
use rq_lib::{
    path, unix_millis_now, AssetChunk, FileEntry, RemoteBackend, RemoteFile, RqError, RqResult,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Clone)]
pub struct RemoteNode {
    pub data: Vec<u8>,
    pub last_modified: u64,
    pub is_dir: bool,
}

/// In-memory remote repository with injectable latency, failures and call
/// counters.
#[derive(Default)]
pub struct MockRemote {
    nodes: Mutex<HashMap<String, RemoteNode>>,
    uploads_in_progress: Mutex<HashMap<String, Vec<u8>>>,
    open_delay: Mutex<Duration>,
    fail_list: Mutex<Option<RqError>>,
    fail_stat: Mutex<Option<RqError>>,
    fail_delete: Mutex<VecDeque<RqError>>,
    fail_upload: Mutex<VecDeque<RqError>>,
    pub open_count: AtomicUsize,
    pub list_count: AtomicUsize,
    pub stat_count: AtomicUsize,
    pub delete_count: AtomicUsize,
    pub rename_count: AtomicUsize,
    pub upload_chunk_count: AtomicUsize,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_file(&self, tree_path: &str, data: &[u8], last_modified: u64) {
        self.nodes.lock().unwrap().insert(
            tree_path.to_string(),
            RemoteNode {
                data: data.to_vec(),
                last_modified,
                is_dir: false,
            },
        );
    }

    pub fn put_dir(&self, tree_path: &str) {
        self.nodes.lock().unwrap().insert(
            tree_path.to_string(),
            RemoteNode {
                data: Vec::new(),
                last_modified: unix_millis_now(),
                is_dir: true,
            },
        );
    }

    pub fn remove_node(&self, tree_path: &str) {
        self.nodes.lock().unwrap().remove(tree_path);
    }

    pub fn set_mtime(&self, tree_path: &str, last_modified: u64) {
        if let Some(node) = self.nodes.lock().unwrap().get_mut(tree_path) {
            node.last_modified = last_modified;
        }
    }

    pub fn node(&self, tree_path: &str) -> Option<RemoteNode> {
        self.nodes.lock().unwrap().get(tree_path).cloned()
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = delay;
    }

    pub fn fail_list_with(&self, err: RqError) {
        *self.fail_list.lock().unwrap() = Some(err);
    }

    pub fn fail_stat_with(&self, err: RqError) {
        *self.fail_stat.lock().unwrap() = Some(err);
    }

    pub fn fail_deletes_with(&self, errors: Vec<RqError>) {
        self.fail_delete.lock().unwrap().extend(errors);
    }

    pub fn fail_uploads_with(&self, errors: Vec<RqError>) {
        self.fail_upload.lock().unwrap().extend(errors);
    }

    fn entry_for(&self, tree_path: &str, node: &RemoteNode) -> FileEntry {
        if node.is_dir {
            FileEntry::new_directory(tree_path, node.last_modified)
        } else {
            FileEntry::new_file(tree_path, node.data.len() as u64, node.last_modified)
        }
    }
}

#[async_trait]
impl RemoteBackend for MockRemote {
    async fn list(&self, parent: &str) -> RqResult<Vec<FileEntry>> {
        self.list_count.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail_list.lock().unwrap().clone() {
            return Err(err);
        }
        let nodes = self.nodes.lock().unwrap();
        let mut out: Vec<FileEntry> = nodes
            .iter()
            .filter(|(p, _)| path::parent_of(p) == parent && p.as_str() != parent)
            .map(|(p, n)| self.entry_for(p, n))
            .collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    async fn stat(&self, tree_path: &str) -> RqResult<FileEntry> {
        self.stat_count.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail_stat.lock().unwrap().clone() {
            return Err(err);
        }
        let nodes = self.nodes.lock().unwrap();
        nodes
            .get(tree_path)
            .map(|n| self.entry_for(tree_path, n))
            .ok_or_else(|| RqError::NotFound(tree_path.to_string()))
    }

    async fn open(&self, tree_path: &str) -> RqResult<RemoteFile> {
        self.open_count.fetch_add(1, Ordering::SeqCst);
        let (entry, data, delay) = {
            let nodes = self.nodes.lock().unwrap();
            let node = nodes
                .get(tree_path)
                .ok_or_else(|| RqError::NotFound(tree_path.to_string()))?;
            (
                self.entry_for(tree_path, node),
                node.data.clone(),
                *self.open_delay.lock().unwrap(),
            )
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(RemoteFile {
            entry,
            reader: Box::pin(std::io::Cursor::new(data)),
        })
    }

    async fn create_directory(&self, tree_path: &str) -> RqResult<()> {
        self.put_dir(tree_path);
        Ok(())
    }

    async fn delete(&self, tree_path: &str) -> RqResult<()> {
        self.delete_count.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail_delete.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut nodes = self.nodes.lock().unwrap();
        if nodes.remove(tree_path).is_none() {
            return Err(RqError::NotFound(tree_path.to_string()));
        }
        nodes.retain(|p, _| !path::is_descendant(tree_path, p));
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str, _overwrite: bool) -> RqResult<()> {
        self.rename_count.fetch_add(1, Ordering::SeqCst);
        let mut nodes = self.nodes.lock().unwrap();
        let moved: Vec<(String, RemoteNode)> = nodes
            .iter()
            .filter(|(p, _)| p.as_str() == from || path::is_descendant(from, p))
            .map(|(p, n)| (p.clone(), n.clone()))
            .collect();
        if moved.is_empty() {
            return Err(RqError::NotFound(from.to_string()));
        }
        for (p, node) in moved {
            nodes.remove(&p);
            let suffix = &p[from.len()..];
            nodes.insert(format!("{}{}", to, suffix), node);
        }
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> RqResult<()> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get(from)
            .cloned()
            .ok_or_else(|| RqError::NotFound(from.to_string()))?;
        nodes.insert(to.to_string(), node);
        Ok(())
    }

    async fn upload_chunk(&self, tree_path: &str, chunk: AssetChunk) -> RqResult<()> {
        self.upload_chunk_count.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail_upload.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut in_progress = self.uploads_in_progress.lock().unwrap();
        let buf = in_progress.entry(tree_path.to_string()).or_default();
        if buf.len() as u64 != chunk.offset {
            return Err(RqError::InvalidParam(format!(
                "chunk offset {} does not match received {}",
                chunk.offset,
                buf.len()
            )));
        }
        buf.extend_from_slice(&chunk.data);
        if chunk.completed {
            let data = in_progress.remove(tree_path).unwrap_or_default();
            drop(in_progress);
            self.put_file(tree_path, &data, unix_millis_now());
        }
        Ok(())
    }
}
