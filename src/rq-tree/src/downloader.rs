use log::{debug, warn};
use rq_lib::{
    EventHub, FileEntry, LocalBackend, RemoteBackend, RqError, RqResult, ShareEvent,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use work_store::{WorkFileMeta, WorkFileStore};

type FetchResult = RqResult<u64>;

struct DownloadState {
    waiters: Vec<oneshot::Sender<FetchResult>>,
}

/// Single-flight fetch coordination: at most one concurrent download per
/// remote path across every open tree handle of the share. Late callers
/// queue as waiters and observe the leader's result.
pub struct DownloadCoordinator {
    inflight: Mutex<HashMap<String, DownloadState>>,
}

impl DownloadCoordinator {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_downloading(&self, tree_path: &str) -> bool {
        self.inflight.lock().unwrap().contains_key(tree_path)
    }

    /// Makes the cached copy of `remote_entry` current, fetching at most
    /// once however many handles ask concurrently. Returns bytes fetched
    /// (0 when the cache was already fresh).
    pub async fn ensure_local(
        &self,
        remote: &Arc<dyn RemoteBackend>,
        local: &Arc<dyn LocalBackend>,
        work: &WorkFileStore,
        events: &EventHub,
        remote_entry: &FileEntry,
    ) -> FetchResult {
        if self.is_fresh(local, work, remote_entry).await? {
            return Ok(0);
        }
        self.fetch(remote, local, work, events, remote_entry).await
    }

    /// Unconditional fetch. This is the one path that adopts a remote
    /// last-modified that moved backward.
    pub async fn cache_file(
        &self,
        remote: &Arc<dyn RemoteBackend>,
        local: &Arc<dyn LocalBackend>,
        work: &WorkFileStore,
        events: &EventHub,
        remote_entry: &FileEntry,
    ) -> FetchResult {
        self.fetch(remote, local, work, events, remote_entry).await
    }

    async fn is_fresh(
        &self,
        local: &Arc<dyn LocalBackend>,
        work: &WorkFileStore,
        remote_entry: &FileEntry,
    ) -> RqResult<bool> {
        let tree_path = remote_entry.path.as_str();
        if !local.exists(tree_path).await? {
            return Ok(false);
        }
        let Some(meta) = work.read(tree_path).await? else {
            return Ok(false);
        };
        if meta.remote_last_modified == remote_entry.last_modified {
            return Ok(true);
        }
        if remote_entry.last_modified < meta.remote_last_modified {
            // A remote clock that went backward does not invalidate the
            // cache; only an explicit cache_file adopts the regressed value.
            debug!(
                "remote mtime for {} went backward ({} < {}), keeping cache",
                tree_path, remote_entry.last_modified, meta.remote_last_modified
            );
            return Ok(true);
        }
        Ok(false)
    }

    async fn fetch(
        &self,
        remote: &Arc<dyn RemoteBackend>,
        local: &Arc<dyn LocalBackend>,
        work: &WorkFileStore,
        events: &EventHub,
        remote_entry: &FileEntry,
    ) -> FetchResult {
        let tree_path = remote_entry.path.clone();

        let wait_rx = {
            let mut inflight = self.inflight.lock().unwrap();
            match inflight.get_mut(&tree_path) {
                Some(state) => {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push(tx);
                    Some(rx)
                }
                None => {
                    inflight.insert(tree_path.clone(), DownloadState { waiters: Vec::new() });
                    None
                }
            }
        };

        if let Some(rx) = wait_rx {
            debug!("joining in-flight download of {}", tree_path);
            return rx
                .await
                .unwrap_or_else(|_| Err(RqError::Internal(format!(
                    "download of {} was interrupted",
                    tree_path
                ))));
        }

        // Leader. The guard flushes waiters on every exit path, including a
        // panic mid-download, so the in-flight slot cannot leak.
        let mut guard = FlightGuard {
            coordinator: self,
            tree_path: &tree_path,
            result: None,
        };

        events.emit(ShareEvent::DownloadStart {
            path: tree_path.clone(),
        });
        let result = Self::perform(remote, local, work, remote_entry).await;
        events.emit(ShareEvent::DownloadEnd {
            path: tree_path.clone(),
            err: result.as_ref().err().map(|e| e.to_string()),
        });
        guard.result = Some(result.clone());
        drop(guard);
        result
    }

    async fn perform(
        remote: &Arc<dyn RemoteBackend>,
        local: &Arc<dyn LocalBackend>,
        work: &WorkFileStore,
        remote_entry: &FileEntry,
    ) -> FetchResult {
        let tree_path = remote_entry.path.as_str();
        let file = remote.open(tree_path).await?;
        let copied = local.download(tree_path, file.reader).await?;
        work.write(tree_path, &WorkFileMeta::new(file.entry.last_modified))
            .await?;
        debug!("downloaded {} ({} bytes)", tree_path, copied);
        Ok(copied)
    }
}

impl Default for DownloadCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

struct FlightGuard<'a> {
    coordinator: &'a DownloadCoordinator,
    tree_path: &'a str,
    result: Option<FetchResult>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let state = self
            .coordinator
            .inflight
            .lock()
            .unwrap()
            .remove(self.tree_path);
        let result = self.result.take().unwrap_or_else(|| {
            warn!("download of {} dropped without a result", self.tree_path);
            Err(RqError::Internal(format!(
                "download of {} was interrupted",
                self.tree_path
            )))
        });
        if let Some(state) = state {
            for tx in state.waiters {
                let _ = tx.send(result.clone());
            }
        }
    }
}
