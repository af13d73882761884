use crate::{FileEntry, RqResult};
use async_trait::async_trait;
use std::path::PathBuf;
use std::pin::Pin;
use tokio::io::AsyncRead;

pub type ByteReader = Pin<Box<dyn AsyncRead + Send>>;

/// Open remote file: metadata plus a streaming body.
pub struct RemoteFile {
    pub entry: FileEntry,
    pub reader: ByteReader,
}

/// One slice of a chunked asset upload. The wire encoding (multipart fields,
/// offset headers) is the backend's concern; callers only describe the slice.
pub struct AssetChunk {
    pub data: Vec<u8>,
    pub offset: u64,
    /// Total length of the file being uploaded.
    pub file_size: u64,
    /// Last chunk of the upload.
    pub completed: bool,
}

/// Remote content repository. The production implementation speaks
/// JSON-over-HTTP; tests substitute in-memory fakes.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn list(&self, parent: &str) -> RqResult<Vec<FileEntry>>;
    async fn stat(&self, path: &str) -> RqResult<FileEntry>;
    async fn open(&self, path: &str) -> RqResult<RemoteFile>;
    async fn create_directory(&self, path: &str) -> RqResult<()>;
    async fn delete(&self, path: &str) -> RqResult<()>;
    async fn rename(&self, from: &str, to: &str, overwrite: bool) -> RqResult<()>;
    async fn copy(&self, from: &str, to: &str) -> RqResult<()>;
    async fn upload_chunk(&self, path: &str, chunk: AssetChunk) -> RqResult<()>;
}

/// Local content cache. Paths are logical tree paths; the implementation
/// maps them onto a root directory.
#[async_trait]
pub trait LocalBackend: Send + Sync {
    async fn stat(&self, path: &str) -> RqResult<FileEntry>;
    async fn exists(&self, path: &str) -> RqResult<bool>;
    async fn list(&self, parent: &str) -> RqResult<Vec<FileEntry>>;
    async fn open(&self, path: &str) -> RqResult<ByteReader>;
    /// Open for reading at a byte offset (upload resume).
    async fn open_at(&self, path: &str, offset: u64) -> RqResult<ByteReader>;
    async fn write_file(&self, path: &str, data: &[u8]) -> RqResult<()>;
    async fn create_directory(&self, path: &str) -> RqResult<()>;
    async fn remove_file(&self, path: &str) -> RqResult<()>;
    async fn remove_directory(&self, path: &str) -> RqResult<()>;
    async fn rename(&self, from: &str, to: &str) -> RqResult<()>;
    /// Copy a remote byte stream into the cache. Must not leave a partial
    /// content file visible on failure. Returns bytes written.
    async fn download(&self, path: &str, reader: ByteReader) -> RqResult<u64>;
    /// Filesystem location of a cached content file.
    fn content_path(&self, path: &str) -> PathBuf;
}
