use crate::share::{ShareContext, MODIFY_TOLERANCE_MS};
use log::{debug, warn};
use rq_lib::{
    path, ByteReader, EntryOrigin, FileEntry, QueueMethod, RqError, RqResult, ShareEvent,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Open overlay file: merged metadata plus a reader over the cached bytes.
pub struct OpenFile {
    pub entry: FileEntry,
    pub reader: ByteReader,
}

impl std::fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenFile")
            .field("entry", &self.entry)
            .finish_non_exhaustive()
    }
}

enum ListPattern {
    Wildcard { parent: String },
    Exact { path: String },
}

fn parse_pattern(pattern: &str) -> ListPattern {
    match pattern.strip_suffix("/*") {
        Some("") => ListPattern::Wildcard {
            parent: "/".to_string(),
        },
        Some(parent) => ListPattern::Wildcard {
            parent: parent.to_string(),
        },
        None => ListPattern::Exact {
            path: pattern.to_string(),
        },
    }
}

/// One handle onto the overlay: remote tree ∪ local cache ∪ queued
/// mutations, with deterministic visibility. Handles are cheap clones over
/// the share context; state lives in the context.
#[derive(Clone)]
pub struct RqTree {
    ctx: Arc<ShareContext>,
}

impl RqTree {
    pub fn new(ctx: Arc<ShareContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<ShareContext> {
        &self.ctx
    }

    fn norm(&self, p: &str) -> String {
        let cleaned = path::clean(p);
        if self.ctx.config.no_unicode_normalize {
            cleaned
        } else {
            path::normalize(&cleaned)
        }
    }

    /// Visibility: temp paths are local-only; a local copy wins; a queued
    /// delete hides the remote; otherwise the remote decides. Remote
    /// failures make the path invisible rather than erroring.
    pub async fn exists(&self, tree_path: &str) -> bool {
        let p = self.norm(tree_path);
        if path::is_temp_name(&p) {
            return self.ctx.local.exists(&p).await.unwrap_or(false);
        }
        if self.ctx.local.exists(&p).await.unwrap_or(false) {
            return true;
        }
        if self.ctx.queue.is_delete_queued(&p) {
            return false;
        }
        let parent = path::parent_of(&p);
        if let Some(names) = self.ctx.list_cache.get(parent) {
            let name = path::name_of(&p);
            return names
                .iter()
                .any(|n| path::paths_equal(n, name, self.ctx.config.no_unicode_normalize));
        }
        self.ctx.remote.stat(&p).await.is_ok()
    }

    pub async fn open(&self, tree_path: &str) -> RqResult<OpenFile> {
        let p = self.norm(tree_path);
        if path::is_temp_name(&p) {
            return self.open_local(&p).await;
        }
        if self.ctx.queue.is_delete_queued(&p) {
            return Err(RqError::NotFound(p));
        }
        if self.ctx.queue.is_put_queued(&p) {
            return self.open_local(&p).await;
        }

        match self.ctx.remote.stat(&p).await {
            Ok(remote_entry) => {
                if remote_entry.is_directory {
                    return Err(RqError::InvalidParam(format!("open on a directory: {}", p)));
                }
                self.ctx
                    .downloads
                    .ensure_local(
                        &self.ctx.remote,
                        &self.ctx.local,
                        &self.ctx.work,
                        &self.ctx.events,
                        &remote_entry,
                    )
                    .await?;
                let reader = self.ctx.local.open(&p).await?;
                // Size and times reported from the remote entry: a reader
                // that joined an in-flight download must not see the
                // half-written local length.
                Ok(OpenFile {
                    entry: remote_entry.with_origin(EntryOrigin::Both),
                    reader,
                })
            }
            Err(RqError::NotFound(_)) => self.open_local(&p).await,
            Err(e) => {
                if self.ctx.local.exists(&p).await.unwrap_or(false) {
                    warn!("open {} falling back to cache: {}", p, e);
                    self.open_local(&p).await
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn open_local(&self, p: &str) -> RqResult<OpenFile> {
        let entry = self.ctx.local.stat(p).await?;
        if entry.is_directory {
            return Err(RqError::InvalidParam(format!("open on a directory: {}", p)));
        }
        let reader = self.ctx.local.open(p).await?;
        Ok(OpenFile { entry, reader })
    }

    /// Merged listing. Remote failures degrade to the local+queued view
    /// instead of failing the call.
    pub async fn list(&self, pattern: &str) -> RqResult<Vec<FileEntry>> {
        match parse_pattern(&self.norm(pattern)) {
            ListPattern::Exact { path: p } => {
                if path::is_temp_name(&p) {
                    return match self.ctx.local.stat(&p).await {
                        Ok(entry) => Ok(vec![entry]),
                        Err(RqError::NotFound(_)) => Ok(Vec::new()),
                        Err(e) => Err(e),
                    };
                }
                if self.ctx.downloads.is_downloading(&p) {
                    return Err(RqError::NotReady(p));
                }
                let merged = self.list_parent(path::parent_of(&p)).await?;
                let no_norm = self.ctx.config.no_unicode_normalize;
                Ok(merged
                    .into_iter()
                    .filter(|e| path::paths_equal(&e.path, &p, no_norm))
                    .collect())
            }
            ListPattern::Wildcard { parent } => self.list_parent(&parent).await,
        }
    }

    async fn list_parent(&self, parent: &str) -> RqResult<Vec<FileEntry>> {
        let (remote_entries, remote_ok) = match self.remote_list(parent).await {
            Ok(entries) => (entries, true),
            Err(e) => {
                warn!("list {} remote failure, local view only: {}", parent, e);
                (Vec::new(), false)
            }
        };
        let local_entries = self.ctx.local.list(parent).await.unwrap_or_default();

        let no_norm = self.ctx.config.no_unicode_normalize;
        let key = |name: &str| -> String {
            if no_norm {
                name.to_string()
            } else {
                path::normalize(name)
            }
        };
        let mut local_by_name: HashMap<String, FileEntry> = local_entries
            .into_iter()
            .map(|e| (key(e.name()), e))
            .collect();

        let mut out = Vec::new();
        for remote_entry in remote_entries {
            if self.ctx.queue.is_delete_queued(&remote_entry.path) {
                continue;
            }
            match local_by_name.remove(&key(remote_entry.name())) {
                Some(local_entry) => {
                    if !remote_entry.is_directory
                        && !local_entry.is_directory
                        && !self.ctx.work.has(&local_entry.path).await
                    {
                        // Cached content of remote origin without a sync
                        // baseline cannot be reconciled silently.
                        self.ctx.events.emit(ShareEvent::SyncConflict {
                            path: local_entry.path.clone(),
                        });
                    }
                    out.push(remote_entry.with_origin(EntryOrigin::Both));
                }
                None => out.push(remote_entry),
            }
        }

        for (_, local_entry) in local_by_name {
            if local_entry.is_directory || path::is_temp_name(&local_entry.path) {
                out.push(local_entry);
                continue;
            }
            if self.ctx.queue.is_put_queued(&local_entry.path) {
                out.push(local_entry);
                continue;
            }
            if self.ctx.queue.is_delete_queued(&local_entry.path) {
                continue;
            }
            match self.ctx.work.read(&local_entry.path).await? {
                None => {
                    if local_entry.last_modified > local_entry.created + MODIFY_TOLERANCE_MS {
                        self.ctx.events.emit(ShareEvent::SyncConflict {
                            path: local_entry.path.clone(),
                        });
                    }
                    out.push(local_entry);
                }
                Some(_) if remote_ok => {
                    // Baseline exists but the remote no longer lists the
                    // file: the remote deleted it.
                    if self.ctx.can_delete(&local_entry.path).await.unwrap_or(false) {
                        debug!("remote deleted {}, dropping cached copy", local_entry.path);
                        if let Err(e) = self.ctx.local.remove_file(&local_entry.path).await {
                            warn!("dropping {} failed: {}", local_entry.path, e);
                        }
                        let _ = self.ctx.work.remove(&local_entry.path).await;
                    } else {
                        self.ctx.events.emit(ShareEvent::SyncConflict {
                            path: local_entry.path.clone(),
                        });
                        out.push(local_entry);
                    }
                }
                Some(_) => out.push(local_entry),
            }
        }

        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    async fn remote_list(&self, parent: &str) -> RqResult<Vec<FileEntry>> {
        if let Some(names) = self.ctx.list_cache.get(parent) {
            let mut out = Vec::new();
            for name in names {
                if let Some(entry) = self.rehydrate(&path::join(parent, &name)).await? {
                    out.push(entry);
                }
            }
            return Ok(out);
        }
        let entries = self.ctx.remote.list(parent).await?;
        self.ctx
            .list_cache
            .put(parent, entries.iter().map(|e| e.name().to_string()).collect());
        Ok(entries)
    }

    /// Cache-hit listings store names only; entries are rebuilt from the
    /// cheapest source that still has them.
    async fn rehydrate(&self, p: &str) -> RqResult<Option<FileEntry>> {
        if self.ctx.local.exists(p).await? {
            return Ok(Some(self.ctx.local.stat(p).await?));
        }
        match self.ctx.remote.stat(p).await {
            Ok(entry) => Ok(Some(entry)),
            Err(RqError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn create_file(&self, tree_path: &str, data: &[u8]) -> RqResult<()> {
        let p = self.norm(tree_path);
        if self.ctx.downloads.is_downloading(&p) {
            return Err(RqError::NotReady(p));
        }
        if path::is_temp_name(&p) {
            return self.ctx.local.write_file(&p, data).await;
        }
        if self.exists(&p).await {
            return Err(RqError::AlreadyExists(p));
        }
        self.ctx.local.write_file(&p, data).await?;
        self.ctx.queue.enqueue(&p, QueueMethod::Put)?;
        self.ctx.list_cache.invalidate(path::parent_of(&p), false);
        Ok(())
    }

    /// Overwrites the cached content and queues the matching mutation: an
    /// update when the path is already visible, a creation otherwise.
    pub async fn write_file(&self, tree_path: &str, data: &[u8]) -> RqResult<()> {
        let p = self.norm(tree_path);
        if self.ctx.downloads.is_downloading(&p) {
            return Err(RqError::NotReady(p));
        }
        if path::is_temp_name(&p) {
            return self.ctx.local.write_file(&p, data).await;
        }
        let visible = self.exists(&p).await;
        self.ctx.local.write_file(&p, data).await?;
        let method = if visible {
            QueueMethod::Post
        } else {
            QueueMethod::Put
        };
        self.ctx.queue.enqueue(&p, method)?;
        Ok(())
    }

    /// Directories are not queued; the remote create is issued immediately.
    pub async fn create_directory(&self, tree_path: &str) -> RqResult<()> {
        let p = self.norm(tree_path);
        if path::is_temp_name(&p) {
            return self.ctx.local.create_directory(&p).await;
        }
        if self.exists(&p).await {
            return Err(RqError::AlreadyExists(p));
        }
        self.ctx.remote.create_directory(&p).await?;
        self.ctx.local.create_directory(&p).await?;
        self.ctx.list_cache.invalidate(path::parent_of(&p), false);
        Ok(())
    }

    pub async fn delete(&self, tree_path: &str) -> RqResult<()> {
        let p = self.norm(tree_path);
        if path::is_temp_name(&p) {
            // Errors (including a missing file) propagate; temp files have
            // no remote side to fall back to.
            self.ctx.local.remove_file(&p).await?;
            let _ = self.ctx.work.remove(&p).await;
            return Ok(());
        }
        if self.ctx.downloads.is_downloading(&p) {
            return Err(RqError::NotReady(p));
        }
        let local_exists = self.ctx.local.exists(&p).await?;
        if !local_exists && !self.exists(&p).await {
            return Err(RqError::NotFound(p));
        }
        if local_exists {
            self.ctx.local.remove_file(&p).await?;
        }
        let _ = self.ctx.work.remove(&p).await;
        // Coalescing nets a queued creation out to nothing; everything else
        // becomes a pending remote delete.
        self.ctx.queue.enqueue(&p, QueueMethod::Delete)?;
        self.ctx.list_cache.invalidate(path::parent_of(&p), false);
        Ok(())
    }

    /// Directory deletes mirror directory creates: immediate on the remote.
    /// Pending entries underneath are dropped so the processor does not
    /// mutate a subtree that no longer exists.
    pub async fn delete_directory(&self, tree_path: &str) -> RqResult<()> {
        let p = self.norm(tree_path);
        if path::is_temp_name(&p) {
            self.ctx.local.remove_directory(&p).await?;
            return Ok(());
        }
        match self.ctx.remote.delete(&p).await {
            Ok(()) | Err(RqError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        if self.ctx.local.exists(&p).await? {
            self.ctx.local.remove_directory(&p).await?;
        }
        for entry in self.ctx.queue.snapshot() {
            if entry.parent == p || path::is_descendant(&p, &entry.parent) {
                let _ = self.ctx.queue.remove(&entry);
            }
        }
        self.ctx.list_cache.invalidate(path::parent_of(&p), false);
        self.ctx.list_cache.invalidate(&p, true);
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> RqResult<()> {
        let old = self.norm(from);
        let new = self.norm(to);
        if self.ctx.downloads.is_downloading(&old) || self.ctx.downloads.is_downloading(&new) {
            return Err(RqError::NotReady(old));
        }

        let local_exists = self.ctx.local.exists(&old).await?;
        let is_dir = if local_exists {
            self.ctx.local.stat(&old).await?.is_directory
        } else {
            match self.ctx.remote.stat(&old).await {
                Ok(entry) => entry.is_directory,
                Err(RqError::NotFound(_)) if path::is_temp_name(&old) => {
                    return Err(RqError::NotFound(old))
                }
                Err(e) => return Err(e),
            }
        };

        if is_dir {
            self.ctx.remote.rename(&old, &new, false).await?;
            if local_exists {
                self.ctx.local.rename(&old, &new).await?;
            }
            self.ctx.list_cache.invalidate(path::parent_of(&old), false);
            self.ctx.list_cache.invalidate(&old, true);
            self.ctx.list_cache.invalidate(path::parent_of(&new), false);
            return Ok(());
        }

        let dst_exists_remote = if path::is_temp_name(&new) {
            false
        } else {
            match self.ctx.remote.stat(&new).await {
                Ok(_) => true,
                Err(RqError::NotFound(_)) => false,
                Err(e) => {
                    warn!("rename {}: destination probe failed: {}", new, e);
                    false
                }
            }
        };

        // Overwriting a destination that diverged on both sides cannot be
        // reconciled silently; the overwrite still proceeds.
        if dst_exists_remote
            && self.ctx.local.exists(&new).await.unwrap_or(false)
            && !self.ctx.can_delete(&new).await.unwrap_or(true)
        {
            self.ctx.events.emit(ShareEvent::SyncConflict { path: new.clone() });
        }

        if local_exists {
            self.ctx.local.rename(&old, &new).await?;
            if let Err(e) = self.ctx.work.rename(&old, &new).await {
                // Content moved but the baseline did not; surface it and
                // keep going, the queue entry still reflects the move.
                warn!("work file rename {} -> {} failed: {}", old, new, e);
                self.ctx.events.emit(ShareEvent::SyncConflict { path: new.clone() });
            }
        }

        self.ctx.queue.enqueue_move(&old, &new, dst_exists_remote)?;
        self.ctx.list_cache.invalidate(path::parent_of(&old), false);
        self.ctx.list_cache.invalidate(path::parent_of(&new), false);
        Ok(())
    }

    /// Depth-first eviction of cached content. Files with unsynchronized
    /// state are kept and reported; their directories stay behind.
    pub async fn delete_local_directory_recursive(&self, tree_path: &str) -> RqResult<()> {
        let root = self.norm(tree_path);
        let mut dirs = vec![root];
        let mut index = 0;
        while index < dirs.len() {
            let dir = dirs[index].clone();
            index += 1;
            for entry in self.ctx.local.list(&dir).await? {
                if entry.is_directory {
                    dirs.push(entry.path);
                    continue;
                }
                if self.ctx.can_delete(&entry.path).await.unwrap_or(false) {
                    self.ctx.local.remove_file(&entry.path).await?;
                    let _ = self.ctx.work.remove(&entry.path).await;
                } else {
                    self.ctx.events.emit(ShareEvent::SyncConflict {
                        path: entry.path.clone(),
                    });
                }
            }
        }
        // Deepest-first so empty parents can fall too.
        for dir in dirs.iter().rev() {
            if self.ctx.local.list(dir).await?.is_empty() {
                let _ = self.ctx.work.remove_dir(dir).await;
                if self.ctx.local.exists(dir).await? {
                    self.ctx.local.remove_directory(dir).await?;
                }
            }
        }
        Ok(())
    }

    /// Rewrites sync baselines for the cached content under `tree_path`.
    /// Path-scoped; descends only when `deep`. Missing content is not an
    /// error.
    pub async fn refresh_work_files(&self, tree_path: &str, deep: bool) -> RqResult<()> {
        let p = self.norm(tree_path);
        let entry = match self.ctx.local.stat(&p).await {
            Ok(entry) => entry,
            Err(RqError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if !entry.is_directory {
            return self.ctx.work.refresh(&p, entry.last_modified).await;
        }

        let mut dirs = vec![p];
        while let Some(dir) = dirs.pop() {
            for child in self.ctx.local.list(&dir).await? {
                if child.is_directory {
                    if deep {
                        dirs.push(child.path);
                    }
                } else if !path::is_temp_name(&child.path) {
                    self.ctx.work.refresh(&child.path, child.last_modified).await?;
                }
            }
        }
        Ok(())
    }

    /// Direct access to the request queue, the way the file-share layer
    /// records mutations it performed on the cache itself.
    pub async fn queue_data(
        &self,
        tree_path: &str,
        method: QueueMethod,
        destination: Option<&str>,
    ) -> RqResult<()> {
        let p = self.norm(tree_path);
        match method {
            QueueMethod::Move | QueueMethod::Copy => {
                let Some(dst) = destination else {
                    return Err(RqError::InvalidParam(format!(
                        "{} without destination: {}",
                        method, p
                    )));
                };
                let dst = self.norm(dst);
                let dst_exists_remote = if path::is_temp_name(&dst) {
                    false
                } else {
                    self.ctx.remote.stat(&dst).await.is_ok()
                };
                if method == QueueMethod::Move {
                    self.ctx.queue.enqueue_move(&p, &dst, dst_exists_remote)
                } else {
                    self.ctx.queue.enqueue_copy(&p, &dst, dst_exists_remote)
                }
            }
            _ => self.ctx.queue.enqueue(&p, method),
        }
    }

    pub async fn can_delete(&self, tree_path: &str) -> RqResult<bool> {
        let p = self.norm(tree_path);
        self.ctx.can_delete(&p).await
    }

    pub async fn is_downloaded(&self, tree_path: &str) -> RqResult<bool> {
        let p = self.norm(tree_path);
        let downloaded = self.ctx.local.exists(&p).await? && self.ctx.work.has(&p).await;
        self.ctx.events.emit(ShareEvent::IsDownloaded {
            path: p,
            downloaded,
        });
        Ok(downloaded)
    }

    /// Forces a fresh copy of `tree_path` into the cache, adopting the
    /// remote metadata even when its last-modified moved backward.
    pub async fn cache_file(&self, tree_path: &str) -> RqResult<u64> {
        let p = self.norm(tree_path);
        let remote_entry = self.ctx.remote.stat(&p).await?;
        self.ctx
            .downloads
            .cache_file(
                &self.ctx.remote,
                &self.ctx.local,
                &self.ctx.work,
                &self.ctx.events,
                &remote_entry,
            )
            .await
    }

    pub fn clear_cache(&self) {
        self.ctx.list_cache.clear();
    }

    pub fn invalidate_content_cache(&self, tree_path: &str, deep: bool) {
        self.ctx.list_cache.invalidate(&self.norm(tree_path), deep);
    }

    /// Starts a periodic cache walk reporting queued bytes and fresh
    /// conflicts. The returned sweeper owns the timer; stop it to end the
    /// walks.
    pub fn check_cache_size_and_conflicts(&self, interval: std::time::Duration) -> crate::CacheSweeper {
        let sweeper = crate::CacheSweeper::new(self.ctx.clone());
        sweeper.start(interval);
        sweeper
    }
}
