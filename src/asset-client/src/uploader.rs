use log::{info, warn};
use rq_lib::{
    AssetChunk, EventHub, LocalBackend, QueueMethod, RemoteBackend, RqError, RqResult,
    ShareConfig, ShareEvent,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Gate invoked between chunks with `(next_offset, total_size)`. Returning
/// `true` cancels the upload; cancellation is not an error.
pub type ChunkGate = Box<dyn FnMut(u64, u64) -> bool + Send>;

pub struct UploadOptions {
    /// `Put` for a new asset, `Post` for a replacement; only the emitted
    /// events differ.
    pub method: QueueMethod,
    /// Skip this many initial bytes (resume).
    pub from_offset: u64,
    pub on_chunk: Option<ChunkGate>,
    /// External abort signal; aborting leaves the caller's queue entry in
    /// place for the next cycle.
    pub abort: Option<CancellationToken>,
}

impl UploadOptions {
    pub fn create() -> Self {
        Self {
            method: QueueMethod::Put,
            from_offset: 0,
            on_chunk: None,
            abort: None,
        }
    }

    pub fn replace() -> Self {
        Self {
            method: QueueMethod::Post,
            ..Self::create()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Completed,
    /// The chunk gate asked to stop; bytes up to `at_offset` are committed.
    Cancelled { at_offset: u64 },
    Aborted,
}

enum ChunkSend {
    Sent,
    Aborted,
}

/// Streams a local cached file to the remote asset endpoint in fixed-size
/// chunks. Each chunk is retried in place with a delay; the retry budget
/// resets on every successful chunk. A checked-out remote fails immediately.
pub struct ChunkUploader {
    remote: Arc<dyn RemoteBackend>,
    local: Arc<dyn LocalBackend>,
    events: EventHub,
    chunk_size: u64,
    max_retries: u32,
    retry_delay: std::time::Duration,
}

impl ChunkUploader {
    pub fn new(
        remote: Arc<dyn RemoteBackend>,
        local: Arc<dyn LocalBackend>,
        events: EventHub,
        config: &ShareConfig,
    ) -> Self {
        Self {
            remote,
            local,
            events,
            chunk_size: config.chunk_size_bytes().max(1),
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
        }
    }

    pub async fn upload(
        &self,
        tree_path: &str,
        mut opts: UploadOptions,
    ) -> RqResult<UploadOutcome> {
        let entry = self.local.stat(tree_path).await?;
        let total = entry.size;
        let mut offset = opts.from_offset;
        if offset > total {
            return Err(RqError::InvalidParam(format!(
                "resume offset {} beyond file size {}",
                offset, total
            )));
        }

        self.events.emit(ShareEvent::SyncFileStart {
            path: tree_path.to_string(),
            method: opts.method,
        });

        let abort = opts.abort.clone().unwrap_or_default();
        match self.run_chunks(tree_path, total, &mut offset, &mut opts, &abort).await {
            Ok(outcome) => {
                match outcome {
                    UploadOutcome::Completed => {
                        info!("upload {} done, {} bytes", tree_path, total);
                        self.events.emit(ShareEvent::SyncFileEnd {
                            path: tree_path.to_string(),
                        });
                    }
                    UploadOutcome::Cancelled { at_offset } => {
                        info!("upload {} cancelled at {}", tree_path, at_offset);
                        self.events.emit(ShareEvent::SyncFileEnd {
                            path: tree_path.to_string(),
                        });
                    }
                    UploadOutcome::Aborted => {
                        self.events.emit(ShareEvent::SyncFileAbort {
                            path: tree_path.to_string(),
                        });
                    }
                }
                Ok(outcome)
            }
            Err(e) => {
                self.events.emit(ShareEvent::SyncFileErr {
                    path: tree_path.to_string(),
                    err: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_chunks(
        &self,
        tree_path: &str,
        total: u64,
        offset: &mut u64,
        opts: &mut UploadOptions,
        abort: &CancellationToken,
    ) -> RqResult<UploadOutcome> {
        let mut reader = self.local.open_at(tree_path, *offset).await?;
        let started = Instant::now();
        let resume_base = *offset;

        loop {
            let want = std::cmp::min(self.chunk_size, total - *offset) as usize;
            let mut buf = vec![0u8; want];
            let mut filled = 0usize;
            while filled < want {
                let n = reader.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled < want {
                // File shrank under us; ship what exists and finish.
                warn!(
                    "upload {}: short read at {} ({} of {})",
                    tree_path, offset, filled, want
                );
                buf.truncate(filled);
            }
            let completed = *offset + buf.len() as u64 >= total || filled < want;
            let chunk_len = buf.len() as u64;

            match self
                .send_chunk_with_retry(
                    tree_path,
                    AssetChunk {
                        data: buf,
                        offset: *offset,
                        file_size: total,
                        completed,
                    },
                    abort,
                )
                .await?
            {
                ChunkSend::Sent => {}
                ChunkSend::Aborted => return Ok(UploadOutcome::Aborted),
            }

            *offset += chunk_len;
            let elapsed = started.elapsed().as_secs_f64();
            let rate = if elapsed > 0.0 {
                ((*offset - resume_base) as f64 / elapsed) as u64
            } else {
                0
            };
            self.events.emit(ShareEvent::SyncFileProgress {
                path: tree_path.to_string(),
                read: *offset,
                total,
                rate,
            });

            if completed {
                return Ok(UploadOutcome::Completed);
            }
            if let Some(gate) = opts.on_chunk.as_mut() {
                if gate(*offset, total) {
                    return Ok(UploadOutcome::Cancelled { at_offset: *offset });
                }
            }
        }
    }

    /// Retries the same chunk until it lands or the budget is spent. Aborts
    /// cut the in-flight request; access-denied never retries.
    async fn send_chunk_with_retry(
        &self,
        tree_path: &str,
        chunk: AssetChunk,
        abort: &CancellationToken,
    ) -> RqResult<ChunkSend> {
        let mut retries = 0u32;
        loop {
            let attempt = AssetChunk {
                data: chunk.data.clone(),
                offset: chunk.offset,
                file_size: chunk.file_size,
                completed: chunk.completed,
            };
            let result = tokio::select! {
                biased;
                _ = abort.cancelled() => {
                    warn!("upload {} aborted at chunk {}", tree_path, chunk.offset);
                    return Ok(ChunkSend::Aborted);
                }
                res = self.remote.upload_chunk(tree_path, attempt) => res,
            };
            match result {
                Ok(()) => return Ok(ChunkSend::Sent),
                Err(e @ RqError::AccessDenied(_)) => return Err(e),
                Err(e) => {
                    retries += 1;
                    if retries >= self.max_retries {
                        warn!(
                            "upload {} chunk at {} failed after {} retries: {}",
                            tree_path, chunk.offset, retries, e
                        );
                        return Err(e);
                    }
                    warn!(
                        "upload {} chunk at {} failed (retry {}/{}): {}",
                        tree_path, chunk.offset, retries, self.max_retries, e
                    );
                    sleep(self.retry_delay).await;
                }
            }
        }
    }
}
