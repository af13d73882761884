use log::{debug, warn};
use rq_lib::{path, unix_millis_now, QueueMethod, RqError, RqResult};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;

/// One pending remote mutation, keyed by `(parent, name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub parent: String,
    pub name: String,
    pub method: QueueMethod,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub destination: Option<String>,
    pub timestamp: u64,
    #[serde(default)]
    pub retries: u32,
}

impl QueueEntry {
    fn new(tree_path: &str, method: QueueMethod) -> Self {
        Self {
            parent: path::parent_of(tree_path).to_string(),
            name: path::name_of(tree_path).to_string(),
            method,
            destination: None,
            timestamp: unix_millis_now(),
            retries: 0,
        }
    }

    pub fn path(&self) -> String {
        path::join(&self.parent, &self.name)
    }

    fn same_key(&self, other: &QueueEntry) -> bool {
        self.parent == other.parent && self.name == other.name
    }
}

/// Net effect of stacking `incoming` onto an existing entry for the same
/// key. `None` means the key ends up with no entry at all.
fn coalesce(existing: Option<QueueMethod>, incoming: QueueMethod) -> Option<QueueMethod> {
    use QueueMethod::*;
    match (existing, incoming) {
        (None, m) => Some(m),
        // A locally created file stays a creation whatever happens to it,
        // and vanishes entirely if deleted before it ever reached the remote.
        (Some(Put), Put) | (Some(Put), Post) => Some(Put),
        (Some(Put), Delete) => None,
        // Updates absorb further writes; delete-then-recreate nets to an
        // update of the still-existing remote file.
        (Some(Post), Put) | (Some(Post), Post) => Some(Post),
        (Some(Post), Delete) => Some(Delete),
        (Some(Delete), Put) | (Some(Delete), Post) => Some(Post),
        (Some(Delete), Delete) => Some(Delete),
        (e, m) => {
            // MOVE/COPY are reduced before they reach this table.
            warn!("unexpected coalesce {:?} <- {:?}", e, m);
            Some(m)
        }
    }
}

const PURGED_FILE_NAME: &str = "purged.jsonl";

/// Durable FIFO of pending remote mutations for one share.
///
/// Persistence is append-with-rewrite: a plain enqueue appends one JSON
/// line; any coalesce, removal or retry bump rewrites the whole file. The
/// file is rewritten through a temp sibling so a crash never truncates it.
pub struct RequestQueue {
    file: PathBuf,
    inner: Mutex<Vec<QueueEntry>>,
}

impl RequestQueue {
    pub fn load(file: PathBuf) -> RqResult<Self> {
        let mut entries = Vec::new();
        let mut skipped = 0usize;
        match File::open(&file) {
            Ok(f) => {
                for (lineno, line) in BufReader::new(f).lines().enumerate() {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<QueueEntry>(&line) {
                        Ok(entry) => entries.push(entry),
                        Err(e) => {
                            warn!(
                                "queue {}:{}: skipping malformed entry: {}",
                                file.display(),
                                lineno + 1,
                                e
                            );
                            skipped += 1;
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!("queue loaded, {} pending entries", entries.len());
        let queue = Self {
            file,
            inner: Mutex::new(entries),
        };
        if skipped > 0 {
            // Compact away the lines we refused to carry forward.
            let snapshot = queue.snapshot();
            queue.rewrite(&snapshot)?;
        }
        Ok(queue)
    }

    fn rewrite(&self, entries: &[QueueEntry]) -> RqResult<()> {
        if let Some(parent) = self.file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.file.with_extension("jsonl.tmp");
        {
            let mut f = File::create(&tmp)?;
            for entry in entries {
                let line = serde_json::to_string(entry)
                    .map_err(|e| RqError::Internal(format!("encode queue entry: {}", e)))?;
                writeln!(f, "{}", line)?;
            }
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &self.file)?;
        Ok(())
    }

    fn append(&self, entry: &QueueEntry) -> RqResult<()> {
        if let Some(parent) = self.file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut f = OpenOptions::new().create(true).append(true).open(&self.file)?;
        let line = serde_json::to_string(entry)
            .map_err(|e| RqError::Internal(format!("encode queue entry: {}", e)))?;
        writeln!(f, "{}", line)?;
        Ok(())
    }

    /// Stacks a mutation onto the queue, applying the coalescing rules.
    /// Temp paths never enter the queue.
    pub fn enqueue(&self, tree_path: &str, method: QueueMethod) -> RqResult<()> {
        if path::is_temp_name(tree_path) {
            debug!("enqueue skipped for temp path {}", tree_path);
            return Ok(());
        }
        if matches!(method, QueueMethod::Move | QueueMethod::Copy) {
            return Err(RqError::InvalidParam(
                "MOVE/COPY must go through enqueue_move/enqueue_copy".to_string(),
            ));
        }

        let mut inner = self.inner.lock().unwrap();
        let pos = inner
            .iter()
            .position(|e| e.parent == path::parent_of(tree_path) && e.name == path::name_of(tree_path));
        let existing = pos.map(|i| inner[i].method);

        match coalesce(existing, method) {
            Some(net) if existing.is_none() => {
                let entry = QueueEntry::new(tree_path, net);
                inner.push(entry.clone());
                drop(inner);
                self.append(&entry)
            }
            Some(net) => {
                let i = pos.unwrap();
                if inner[i].method == net {
                    // Net effect unchanged; keep the original entry (and its
                    // queue position and retry count).
                    return Ok(());
                }
                inner[i].method = net;
                inner[i].timestamp = unix_millis_now();
                inner[i].retries = 0;
                let snapshot = inner.clone();
                drop(inner);
                self.rewrite(&snapshot)
            }
            None => {
                if let Some(i) = pos {
                    inner.remove(i);
                    let snapshot = inner.clone();
                    drop(inner);
                    return self.rewrite(&snapshot);
                }
                Ok(())
            }
        }
    }

    /// MOVE: the source nets out to a delete (which clears a pending
    /// creation entirely), the destination becomes a create, or an update
    /// when it already exists remotely. Temp paths on either side drop the
    /// corresponding half.
    pub fn enqueue_move(
        &self,
        src: &str,
        dst: &str,
        dst_exists_remote: bool,
    ) -> RqResult<()> {
        if !path::is_temp_name(src) {
            self.enqueue(src, QueueMethod::Delete)?;
        }
        if !path::is_temp_name(dst) {
            let method = if dst_exists_remote {
                QueueMethod::Post
            } else {
                QueueMethod::Put
            };
            self.enqueue(dst, method)?;
        }
        Ok(())
    }

    /// COPY: the source is untouched; the destination gets its natural
    /// effect.
    pub fn enqueue_copy(
        &self,
        _src: &str,
        dst: &str,
        dst_exists_remote: bool,
    ) -> RqResult<()> {
        if !path::is_temp_name(dst) {
            let method = if dst_exists_remote {
                QueueMethod::Post
            } else {
                QueueMethod::Put
            };
            self.enqueue(dst, method)?;
        }
        Ok(())
    }

    /// Oldest pending entry, without removing it. The processor removes it
    /// explicitly once the remote accepted the mutation.
    pub fn head(&self) -> Option<QueueEntry> {
        self.inner.lock().unwrap().first().cloned()
    }

    /// Oldest pending entry under `parent`.
    pub fn head_for_parent(&self, parent: &str) -> Option<QueueEntry> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.parent == parent)
            .cloned()
    }

    pub fn find(&self, tree_path: &str) -> Option<QueueEntry> {
        let parent = path::parent_of(tree_path);
        let name = path::name_of(tree_path);
        self.inner
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.parent == parent && e.name == name)
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.inner.lock().unwrap().clone()
    }

    /// Removes the entry only if it is still the one the caller processed;
    /// a coalesce that replaced it in the meantime wins.
    pub fn remove(&self, entry: &QueueEntry) -> RqResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let Some(i) = inner.iter().position(|e| {
            e.same_key(entry) && e.method == entry.method && e.timestamp == entry.timestamp
        }) else {
            return Ok(false);
        };
        inner.remove(i);
        let snapshot = inner.clone();
        drop(inner);
        self.rewrite(&snapshot)?;
        Ok(true)
    }

    /// Bumps the retry counter, returning the new count.
    pub fn increment_retry(&self, entry: &QueueEntry) -> RqResult<u32> {
        let mut inner = self.inner.lock().unwrap();
        let Some(i) = inner.iter().position(|e| e.same_key(entry)) else {
            return Ok(entry.retries);
        };
        inner[i].retries += 1;
        let retries = inner[i].retries;
        let snapshot = inner.clone();
        drop(inner);
        self.rewrite(&snapshot)?;
        Ok(retries)
    }

    /// Drops a poison entry, recording it in the purged ledger next to the
    /// queue file so repeated failures stay diagnosable after the fact.
    pub fn mark_purged(&self, entry: &QueueEntry) -> RqResult<bool> {
        let removed = self.remove(entry)?;
        if removed {
            let ledger = self.file.with_file_name(PURGED_FILE_NAME);
            let line = serde_json::to_string(entry)
                .map_err(|e| RqError::Internal(format!("encode purged entry: {}", e)))?;
            let mut f = OpenOptions::new().create(true).append(true).open(&ledger)?;
            writeln!(f, "{}", line)?;
        }
        Ok(removed)
    }

    pub fn is_delete_queued(&self, tree_path: &str) -> bool {
        matches!(self.find(tree_path), Some(e) if e.method == QueueMethod::Delete)
    }

    pub fn is_put_queued(&self, tree_path: &str) -> bool {
        matches!(self.find(tree_path), Some(e) if e.method == QueueMethod::Put)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn clear(&self) -> RqResult<()> {
        self.inner.lock().unwrap().clear();
        self.rewrite(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn queue(dir: &tempfile::TempDir) -> RequestQueue {
        RequestQueue::load(dir.path().join("queue.jsonl")).unwrap()
    }

    #[test]
    fn test_coalesce_matrix() {
        use QueueMethod::*;
        // Row PUT
        assert_eq!(coalesce(None, Put), Some(Put));
        assert_eq!(coalesce(Some(Put), Put), Some(Put));
        assert_eq!(coalesce(Some(Post), Put), Some(Post));
        assert_eq!(coalesce(Some(Delete), Put), Some(Post));
        // Row POST
        assert_eq!(coalesce(None, Post), Some(Post));
        assert_eq!(coalesce(Some(Put), Post), Some(Put));
        assert_eq!(coalesce(Some(Post), Post), Some(Post));
        assert_eq!(coalesce(Some(Delete), Post), Some(Post));
        // Row DELETE
        assert_eq!(coalesce(None, Delete), Some(Delete));
        assert_eq!(coalesce(Some(Put), Delete), None);
        assert_eq!(coalesce(Some(Post), Delete), Some(Delete));
        assert_eq!(coalesce(Some(Delete), Delete), Some(Delete));
    }

    #[test]
    fn test_single_entry_per_key() {
        let dir = tempdir().unwrap();
        let q = queue(&dir);
        q.enqueue("/a/f.txt", QueueMethod::Put).unwrap();
        q.enqueue("/a/f.txt", QueueMethod::Post).unwrap();
        q.enqueue("/a/f.txt", QueueMethod::Post).unwrap();
        assert_eq!(q.len(), 1);
        assert_eq!(q.find("/a/f.txt").unwrap().method, QueueMethod::Put);
    }

    #[test]
    fn test_delete_clears_pending_creation() {
        let dir = tempdir().unwrap();
        let q = queue(&dir);
        q.enqueue("/a/new.txt", QueueMethod::Put).unwrap();
        q.enqueue("/a/new.txt", QueueMethod::Delete).unwrap();
        assert!(q.is_empty());
    }

    #[test]
    fn test_idempotent_delete() {
        let dir = tempdir().unwrap();
        let q = queue(&dir);
        q.enqueue("/a/f.txt", QueueMethod::Delete).unwrap();
        let first = q.find("/a/f.txt").unwrap();
        q.enqueue("/a/f.txt", QueueMethod::Delete).unwrap();
        assert_eq!(q.len(), 1);
        // No-op: original entry survives untouched.
        assert_eq!(q.find("/a/f.txt").unwrap(), first);
    }

    #[test]
    fn test_temp_paths_never_enter_queue() {
        let dir = tempdir().unwrap();
        let q = queue(&dir);
        q.enqueue("/a/.swp", QueueMethod::Put).unwrap();
        q.enqueue("/a/.tmp123", QueueMethod::Delete).unwrap();
        assert!(q.is_empty());
    }

    #[test]
    fn test_move_cached_to_normal() {
        let dir = tempdir().unwrap();
        let q = queue(&dir);
        // Previously unqueued cached /a: MOVE /a -> /b
        q.enqueue_move("/a", "/b", false).unwrap();
        assert_eq!(q.find("/a").unwrap().method, QueueMethod::Delete);
        assert_eq!(q.find("/b").unwrap().method, QueueMethod::Put);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_move_onto_remote_destination_is_update() {
        let dir = tempdir().unwrap();
        let q = queue(&dir);
        q.enqueue_move("/a", "/b", true).unwrap();
        assert_eq!(q.find("/a").unwrap().method, QueueMethod::Delete);
        assert_eq!(q.find("/b").unwrap().method, QueueMethod::Post);
    }

    #[test]
    fn test_move_queued_creation_to_temp_clears_source() {
        let dir = tempdir().unwrap();
        let q = queue(&dir);
        q.enqueue("/a", QueueMethod::Put).unwrap();
        q.enqueue_move("/a", "/.hidden", false).unwrap();
        assert!(q.is_empty());
    }

    #[test]
    fn test_move_cached_to_temp_deletes_remote() {
        let dir = tempdir().unwrap();
        let q = queue(&dir);
        q.enqueue_move("/a", "/.hidden", false).unwrap();
        assert_eq!(q.find("/a").unwrap().method, QueueMethod::Delete);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_move_from_temp_creates_destination() {
        let dir = tempdir().unwrap();
        let q = queue(&dir);
        q.enqueue_move("/.draft", "/final.txt", false).unwrap();
        assert!(q.find("/.draft").is_none());
        assert_eq!(q.find("/final.txt").unwrap().method, QueueMethod::Put);
    }

    #[test]
    fn test_move_temp_to_temp_is_noop() {
        let dir = tempdir().unwrap();
        let q = queue(&dir);
        q.enqueue_move("/.a", "/.b", false).unwrap();
        assert!(q.is_empty());
    }

    #[test]
    fn test_copy_leaves_source_untouched() {
        let dir = tempdir().unwrap();
        let q = queue(&dir);
        q.enqueue("/a", QueueMethod::Post).unwrap();
        q.enqueue_copy("/a", "/b", false).unwrap();
        assert_eq!(q.find("/a").unwrap().method, QueueMethod::Post);
        assert_eq!(q.find("/b").unwrap().method, QueueMethod::Put);
    }

    #[test]
    fn test_move_there_and_back_restores_equivalent_state() {
        let dir = tempdir().unwrap();
        let q = queue(&dir);
        q.enqueue_move("/x", "/y", false).unwrap();
        // (/x: DELETE, /y: PUT)
        q.enqueue_move("/y", "/x", true).unwrap();
        // /y PUT + DELETE -> gone; /x DELETE + POST -> POST, i.e. the file
        // ends up updated in place, nothing pending for /y.
        assert!(q.find("/y").is_none());
        assert_eq!(q.find("/x").unwrap().method, QueueMethod::Post);
    }

    #[test]
    fn test_fifo_order_and_head() {
        let dir = tempdir().unwrap();
        let q = queue(&dir);
        q.enqueue("/a/1", QueueMethod::Put).unwrap();
        q.enqueue("/b/2", QueueMethod::Delete).unwrap();
        q.enqueue("/a/3", QueueMethod::Post).unwrap();

        assert_eq!(q.head().unwrap().path(), "/a/1");
        assert_eq!(q.head_for_parent("/b").unwrap().path(), "/b/2");

        // Coalescing an existing key must not change its queue position.
        q.enqueue("/a/1", QueueMethod::Post).unwrap();
        assert_eq!(q.head().unwrap().path(), "/a/1");

        let head = q.head().unwrap();
        assert!(q.remove(&head).unwrap());
        assert_eq!(q.head().unwrap().path(), "/b/2");
    }

    #[test]
    fn test_retry_counter() {
        let dir = tempdir().unwrap();
        let q = queue(&dir);
        q.enqueue("/a/f", QueueMethod::Put).unwrap();
        let e = q.head().unwrap();
        assert_eq!(q.increment_retry(&e).unwrap(), 1);
        assert_eq!(q.increment_retry(&e).unwrap(), 2);
        assert_eq!(q.find("/a/f").unwrap().retries, 2);
    }

    #[test]
    fn test_mark_purged_records_to_ledger() {
        let dir = tempdir().unwrap();
        let q = queue(&dir);
        q.enqueue("/a/poison", QueueMethod::Put).unwrap();
        let entry = q.head().unwrap();

        assert!(q.mark_purged(&entry).unwrap());
        assert!(q.is_empty());
        // Purging the same entry twice is a no-op.
        assert!(!q.mark_purged(&entry).unwrap());

        let ledger = std::fs::read_to_string(dir.path().join("purged.jsonl")).unwrap();
        assert_eq!(ledger.lines().count(), 1);
        let recorded: QueueEntry = serde_json::from_str(ledger.lines().next().unwrap()).unwrap();
        assert_eq!(recorded.name, "poison");
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("queue.jsonl");
        {
            let q = RequestQueue::load(file.clone()).unwrap();
            q.enqueue("/a/f", QueueMethod::Put).unwrap();
            q.enqueue("/b/g", QueueMethod::Delete).unwrap();
            q.enqueue("/a/f", QueueMethod::Delete).unwrap(); // clears /a/f
        }
        let q = RequestQueue::load(file).unwrap();
        assert_eq!(q.len(), 1);
        assert_eq!(q.head().unwrap().path(), "/b/g");
        assert_eq!(q.head().unwrap().method, QueueMethod::Delete);
    }

    #[test]
    fn test_load_skips_malformed_lines() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("queue.jsonl");
        std::fs::write(
            &file,
            "{\"parent\":\"/a\",\"name\":\"f\",\"method\":\"PUT\",\"timestamp\":1}\nnot json\n",
        )
        .unwrap();
        let q = RequestQueue::load(file).unwrap();
        assert_eq!(q.len(), 1);
        assert_eq!(q.head().unwrap().name, "f");
    }
}
