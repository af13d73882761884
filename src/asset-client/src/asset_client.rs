use crate::http_client::HttpTreeClient;
use async_trait::async_trait;
use rq_lib::{
    path, AssetChunk, EventHub, FileEntry, RemoteBackend, RemoteFile, RqError, RqResult,
    ShareEvent,
};
use std::time::Duration;

/// Asset-oriented remote backend. Wraps the generic tree client and layers
/// the asset endpoints (chunked createasset uploads, linked-asset lookup,
/// checked-out handling) on top of it.
pub struct AssetClient {
    http: HttpTreeClient,
    events: EventHub,
}

impl AssetClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        auth_token: Option<String>,
        events: EventHub,
    ) -> RqResult<Self> {
        Ok(Self {
            http: HttpTreeClient::new(base_url, timeout, auth_token)?,
            events,
        })
    }

    pub fn from_parts(http: HttpTreeClient, events: EventHub) -> Self {
        Self { http, events }
    }

    /// Assets referenced by a page or fragment at `tree_path`.
    pub async fn linked_assets(&self, tree_path: &str) -> RqResult<Vec<String>> {
        self.events.emit(ShareEvent::GetLinkedAssets {
            path: tree_path.to_string(),
        });
        self.http.linked_assets(tree_path).await
    }
}

#[async_trait]
impl RemoteBackend for AssetClient {
    async fn list(&self, parent: &str) -> RqResult<Vec<FileEntry>> {
        let entries = self.http.list(parent).await?;
        Ok(entries.into_iter().map(|e| e.into_entry(parent)).collect())
    }

    async fn stat(&self, tree_path: &str) -> RqResult<FileEntry> {
        let wire = self.http.stat(tree_path).await?;
        Ok(wire.into_entry(path::parent_of(tree_path)))
    }

    async fn open(&self, tree_path: &str) -> RqResult<RemoteFile> {
        let wire = self.http.stat(tree_path).await?;
        if wire.is_folder() {
            return Err(RqError::InvalidParam(format!(
                "open on a folder: {}",
                tree_path
            )));
        }
        let entry = wire.into_entry(path::parent_of(tree_path));
        self.events.emit(ShareEvent::DownloadAsset {
            path: tree_path.to_string(),
        });
        let reader = self.http.open_stream(tree_path).await?;
        Ok(RemoteFile { entry, reader })
    }

    async fn create_directory(&self, tree_path: &str) -> RqResult<()> {
        self.http.create_directory(tree_path).await
    }

    async fn delete(&self, tree_path: &str) -> RqResult<()> {
        self.http.delete(tree_path).await
    }

    async fn rename(&self, from: &str, to: &str, overwrite: bool) -> RqResult<()> {
        self.http.rename(from, to, overwrite).await
    }

    async fn copy(&self, from: &str, to: &str) -> RqResult<()> {
        self.http.copy(from, to).await
    }

    async fn upload_chunk(&self, tree_path: &str, chunk: AssetChunk) -> RqResult<()> {
        let completed = chunk.completed;
        self.http.post_asset_chunk(tree_path, chunk).await?;
        if completed {
            self.events.emit(ShareEvent::CreateAsset {
                path: tree_path.to_string(),
            });
        }
        Ok(())
    }
}
