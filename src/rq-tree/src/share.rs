use crate::downloader::DownloadCoordinator;
use crate::overlay::RqTree;
use crate::processor::SyncProcessor;
use crate::sweeper::CacheSweeper;
use log::info;
use rq_lib::{EventHub, LocalBackend, RemoteBackend, RqError, RqResult, ShareConfig};
use std::sync::Arc;
use work_store::{ContentListCache, RequestQueue, WorkFileStore, QUEUE_FILE_NAME};

/// Local mtimes lag behind the instant we record a sync baseline; edits
/// inside this window do not count as local modifications.
pub(crate) const MODIFY_TOLERANCE_MS: u64 = 2_000;

/// Share-scoped state: one queue, one list cache, one download map and one
/// event hub per share, handed to every tree handle. Nothing here is
/// process-global.
pub struct ShareContext {
    pub config: ShareConfig,
    pub remote: Arc<dyn RemoteBackend>,
    pub local: Arc<dyn LocalBackend>,
    pub queue: Arc<RequestQueue>,
    pub work: Arc<WorkFileStore>,
    pub list_cache: Arc<ContentListCache>,
    pub downloads: Arc<DownloadCoordinator>,
    pub events: EventHub,
}

impl ShareContext {
    pub fn new(
        config: ShareConfig,
        remote: Arc<dyn RemoteBackend>,
        local: Arc<dyn LocalBackend>,
        events: EventHub,
    ) -> RqResult<Arc<Self>> {
        let queue = RequestQueue::load(config.work_path.join(QUEUE_FILE_NAME))?;
        let work = WorkFileStore::new(local.content_path("/"));
        let list_cache = ContentListCache::new(config.content_cache_ttl());
        Ok(Arc::new(Self {
            remote,
            local,
            queue: Arc::new(queue),
            work: Arc::new(work),
            list_cache: Arc::new(list_cache),
            downloads: Arc::new(DownloadCoordinator::new()),
            events,
            config,
        }))
    }

    /// A cached file may be silently dropped only when the remote has seen
    /// everything the local copy contains: not a pending creation, baseline
    /// present, and unmodified since the last reconciliation.
    pub async fn can_delete(&self, tree_path: &str) -> RqResult<bool> {
        if self.queue.is_put_queued(tree_path) {
            return Ok(false);
        }
        let Some(meta) = self.work.read(tree_path).await? else {
            return Ok(false);
        };
        let entry = match self.local.stat(tree_path).await {
            Ok(entry) => entry,
            Err(RqError::NotFound(_)) => return Ok(true),
            Err(e) => return Err(e),
        };
        Ok(entry.last_modified <= meta.last_sync + MODIFY_TOLERANCE_MS)
    }
}

/// One mounted share: context plus its background services. Dropping the
/// share does not stop the processor; call `shutdown`.
pub struct RqShare {
    ctx: Arc<ShareContext>,
    processor: Arc<SyncProcessor>,
    sweeper: CacheSweeper,
}

impl RqShare {
    pub fn open(
        config: ShareConfig,
        remote: Arc<dyn RemoteBackend>,
        local: Arc<dyn LocalBackend>,
    ) -> RqResult<Self> {
        let events = EventHub::new();
        let ctx = ShareContext::new(config, remote, local, events)?;
        let processor = Arc::new(SyncProcessor::new(ctx.clone()));
        let sweeper = CacheSweeper::new(ctx.clone());
        if !ctx.config.noprocessor {
            processor.start();
            sweeper.start(ctx.config.cache_sweep_interval());
            info!("share processor started, queue len {}", ctx.queue.len());
        }
        Ok(Self {
            ctx,
            processor,
            sweeper,
        })
    }

    pub fn tree(&self) -> RqTree {
        RqTree::new(self.ctx.clone())
    }

    pub fn context(&self) -> &Arc<ShareContext> {
        &self.ctx
    }

    pub fn events(&self) -> &EventHub {
        &self.ctx.events
    }

    pub fn processor(&self) -> &Arc<SyncProcessor> {
        &self.processor
    }

    pub async fn shutdown(&self) {
        self.sweeper.stop().await;
        self.processor.stop().await;
    }
}
