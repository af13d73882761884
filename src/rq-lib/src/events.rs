use crate::QueueMethod;
use tokio::sync::broadcast;

/// Observable side effects of a share. One hub per share; tree handles and
/// the sync processor publish into it, the file-share layer subscribes.
#[derive(Debug, Clone, PartialEq)]
pub enum ShareEvent {
    SyncStart,
    SyncEnd { processed: usize },
    SyncErr { path: String, err: String },
    SyncAbort,
    SyncProgress { done: usize, total: usize },

    SyncFileStart { path: String, method: QueueMethod },
    SyncFileEnd { path: String },
    SyncFileErr { path: String, err: String },
    SyncFileAbort { path: String },
    SyncFileProgress { path: String, read: u64, total: u64, rate: u64 },

    SyncConflict { path: String },
    SyncPurged { path: String, method: QueueMethod },
    CacheSize { bytes: u64 },

    DownloadStart { path: String },
    DownloadEnd { path: String, err: Option<String> },
    DownloadAsset { path: String },
    CreateAsset { path: String },
    GetLinkedAssets { path: String },
    IsDownloaded { path: String, downloaded: bool },
}

impl ShareEvent {
    pub fn path(&self) -> Option<&str> {
        match self {
            ShareEvent::SyncErr { path, .. }
            | ShareEvent::SyncFileStart { path, .. }
            | ShareEvent::SyncFileEnd { path }
            | ShareEvent::SyncFileErr { path, .. }
            | ShareEvent::SyncFileAbort { path }
            | ShareEvent::SyncFileProgress { path, .. }
            | ShareEvent::SyncConflict { path }
            | ShareEvent::SyncPurged { path, .. }
            | ShareEvent::DownloadStart { path }
            | ShareEvent::DownloadEnd { path, .. }
            | ShareEvent::DownloadAsset { path }
            | ShareEvent::CreateAsset { path }
            | ShareEvent::GetLinkedAssets { path }
            | ShareEvent::IsDownloaded { path, .. } => Some(path),
            _ => None,
        }
    }
}

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<ShareEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShareEvent> {
        self.tx.subscribe()
    }

    /// Emitting with no subscribers is fine; events are observability, not
    /// control flow.
    pub fn emit(&self, event: ShareEvent) {
        if let Err(e) = self.tx.send(event) {
            trace!("event dropped, no subscribers: {:?}", e.0);
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
