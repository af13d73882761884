use crate::share::ShareContext;
use log::warn;
use rq_lib::{path, QueueMethod, RqResult, ShareEvent};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Periodic cache walk: reports the total size of content waiting in the
/// queue and flags files that newly stopped being cleanly deletable since
/// the previous sweep.
pub struct CacheSweeper {
    ctx: Arc<ShareContext>,
    seen_conflicts: Arc<Mutex<HashSet<String>>>,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CacheSweeper {
    pub fn new(ctx: Arc<ShareContext>) -> Self {
        Self {
            ctx,
            seen_conflicts: Arc::new(Mutex::new(HashSet::new())),
            shutdown: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    pub fn start(&self, interval: Duration) {
        let mut guard = self.handle.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let ctx = self.ctx.clone();
        let seen = self.seen_conflicts.clone();
        let shutdown = self.shutdown.clone();
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = Self::sweep(&ctx, &seen).await {
                            warn!("cache sweep failed: {}", e);
                        }
                    }
                }
            }
        }));
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// One walk, driven directly by tests and by the interval task.
    pub async fn sweep_once(&self) -> RqResult<u64> {
        Self::sweep(&self.ctx, &self.seen_conflicts).await
    }

    async fn sweep(
        ctx: &Arc<ShareContext>,
        seen_conflicts: &Arc<Mutex<HashSet<String>>>,
    ) -> RqResult<u64> {
        let mut queued_bytes = 0u64;
        let mut current_conflicts = HashSet::new();

        let mut dirs = vec!["/".to_string()];
        while let Some(dir) = dirs.pop() {
            for entry in ctx.local.list(&dir).await? {
                if entry.is_directory {
                    dirs.push(entry.path);
                    continue;
                }
                if path::is_temp_name(&entry.path) {
                    continue;
                }
                if let Some(queued) = ctx.queue.find(&entry.path) {
                    if queued.method != QueueMethod::Delete {
                        queued_bytes += entry.size;
                    }
                }
                if !ctx.can_delete(&entry.path).await.unwrap_or(false) {
                    current_conflicts.insert(entry.path);
                }
            }
        }

        {
            let mut seen = seen_conflicts.lock().unwrap();
            for conflicted in &current_conflicts {
                if !seen.contains(conflicted) {
                    ctx.events.emit(ShareEvent::SyncConflict {
                        path: conflicted.clone(),
                    });
                }
            }
            // Forgetting resolved paths lets a re-introduced conflict fire
            // again.
            *seen = current_conflicts;
        }

        ctx.events.emit(ShareEvent::CacheSize {
            bytes: queued_bytes,
        });
        Ok(queued_bytes)
    }
}
