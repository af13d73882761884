use crate::share::ShareContext;
use asset_client::{ChunkUploader, UploadOptions, UploadOutcome};
use log::{info, warn};
use rq_lib::{path, QueueMethod, RqError, RqResult, ShareEvent};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use work_store::QueueEntry;

/// Drains the request queue on a timer: uploads for PUT/POST, remote deletes
/// for DELETE, retry counting and purging for entries that keep failing.
pub struct SyncProcessor {
    ctx: Arc<ShareContext>,
    uploader: ChunkUploader,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SyncProcessor {
    pub fn new(ctx: Arc<ShareContext>) -> Self {
        let uploader = ChunkUploader::new(
            ctx.remote.clone(),
            ctx.local.clone(),
            ctx.events.clone(),
            &ctx.config,
        );
        Self {
            ctx,
            uploader,
            shutdown: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn start(self: &Arc<Self>) {
        let mut guard = self.handle.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let this = self.clone();
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.ctx.config.sync_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = this.run_cycle().await {
                            warn!("sync cycle failed: {}", e);
                        }
                    }
                }
            }
        }));
    }

    /// Cancels the timer and waits for the in-flight entry (the running
    /// cycle checks the shutdown signal between entries).
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// One drain pass over the queue. Public so `noprocessor` harnesses can
    /// drive sync deterministically.
    pub async fn run_cycle(&self) -> RqResult<usize> {
        let pending = self.ctx.queue.snapshot();
        if pending.is_empty() {
            return Ok(0);
        }

        self.ctx.events.emit(ShareEvent::SyncStart);
        let total = pending.len();
        let mut done = 0usize;

        for stale in pending {
            if self.shutdown.is_cancelled() {
                self.ctx.events.emit(ShareEvent::SyncAbort);
                break;
            }
            // The entry may have coalesced away or been replaced since the
            // snapshot; always act on the current state.
            let Some(entry) = self.ctx.queue.find(&stale.path()) else {
                continue;
            };
            if entry.method != stale.method || entry.timestamp != stale.timestamp {
                continue;
            }

            if self.process_entry(&entry).await {
                done += 1;
            }
            self.ctx.events.emit(ShareEvent::SyncProgress { done, total });
        }

        self.ctx.events.emit(ShareEvent::SyncEnd { processed: done });
        Ok(done)
    }

    /// Returns true when the entry left the queue through success.
    async fn process_entry(&self, entry: &QueueEntry) -> bool {
        let tree_path = entry.path();

        if path::is_temp_name(&entry.name) {
            // Should never have been enqueued.
            warn!("dropping temp-name queue entry {}", tree_path);
            let _ = self.ctx.queue.remove(entry);
            return false;
        }

        let result = match entry.method {
            QueueMethod::Put | QueueMethod::Post => self.sync_upload(entry, &tree_path).await,
            QueueMethod::Delete => self.sync_delete(&tree_path).await,
            QueueMethod::Move | QueueMethod::Copy => {
                // Reduced to PUT/DELETE at enqueue time; a surviving entry is
                // a persistence artifact.
                warn!("dropping unreduced {} entry for {}", entry.method, tree_path);
                let _ = self.ctx.queue.remove(entry);
                return false;
            }
        };

        match result {
            Ok(true) => {
                let _ = self.ctx.queue.remove(entry);
                true
            }
            Ok(false) => false,
            Err(e) => {
                self.ctx.events.emit(ShareEvent::SyncErr {
                    path: tree_path.clone(),
                    err: e.to_string(),
                });
                let retries = self.ctx.queue.increment_retry(entry).unwrap_or(entry.retries);
                if retries >= self.ctx.config.purge_after_failures {
                    warn!(
                        "purging {} {} after {} failed cycles",
                        entry.method, tree_path, retries
                    );
                    self.ctx.events.emit(ShareEvent::SyncPurged {
                        path: tree_path,
                        method: entry.method,
                    });
                    if let Err(e) = self.ctx.queue.mark_purged(entry) {
                        warn!("recording purge failed: {}", e);
                    }
                }
                false
            }
        }
    }

    async fn sync_upload(&self, entry: &QueueEntry, tree_path: &str) -> RqResult<bool> {
        if !self.ctx.local.exists(tree_path).await? {
            // The cached file vanished under the entry; nothing to ship.
            warn!("queued {} has no cached content, dropping", tree_path);
            return Ok(true);
        }
        let opts = if entry.method == QueueMethod::Put {
            UploadOptions::create()
        } else {
            UploadOptions::replace()
        };
        match self.uploader.upload(tree_path, opts).await? {
            UploadOutcome::Completed => {
                let local = self.ctx.local.stat(tree_path).await?;
                self.ctx.work.refresh(tree_path, local.last_modified).await?;
                info!("synced {} {}", entry.method, tree_path);
                Ok(true)
            }
            UploadOutcome::Cancelled { .. } => Ok(true),
            UploadOutcome::Aborted => Ok(false),
        }
    }

    async fn sync_delete(&self, tree_path: &str) -> RqResult<bool> {
        match self.ctx.remote.delete(tree_path).await {
            Ok(()) => {
                info!("synced DELETE {}", tree_path);
                Ok(true)
            }
            // Already gone remotely: the intent is satisfied.
            Err(RqError::NotFound(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }
}
