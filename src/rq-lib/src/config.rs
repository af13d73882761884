use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

fn default_content_cache_ttl_ms() -> u64 {
    30_000
}

fn default_chunk_upload_size_mb() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    3_000
}

fn default_sync_interval_ms() -> u64 {
    5_000
}

fn default_purge_after_failures() -> u32 {
    10
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_cache_sweep_interval_ms() -> u64 {
    60_000
}

/// Per-share configuration. Everything except `work_path` has a default, so
/// a minimal config file is just `{"work_path": "..."}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ShareConfig {
    /// Directory for queue persistence and per-share state.
    pub work_path: PathBuf,
    #[serde(default = "default_content_cache_ttl_ms")]
    pub content_cache_ttl_ms: u64,
    #[serde(default = "default_chunk_upload_size_mb")]
    pub chunk_upload_size_mb: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Disable the background sync processor (test harnesses).
    #[serde(default)]
    pub noprocessor: bool,
    /// Disable NFD path normalization.
    #[serde(default)]
    pub no_unicode_normalize: bool,
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    /// Sync cycles an entry may fail before it is purged from the queue.
    #[serde(default = "default_purge_after_failures")]
    pub purge_after_failures: u32,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_cache_sweep_interval_ms")]
    pub cache_sweep_interval_ms: u64,
}

impl ShareConfig {
    pub fn new(work_path: impl Into<PathBuf>) -> Self {
        Self {
            work_path: work_path.into(),
            content_cache_ttl_ms: default_content_cache_ttl_ms(),
            chunk_upload_size_mb: default_chunk_upload_size_mb(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            noprocessor: false,
            no_unicode_normalize: false,
            sync_interval_ms: default_sync_interval_ms(),
            purge_after_failures: default_purge_after_failures(),
            request_timeout_ms: default_request_timeout_ms(),
            cache_sweep_interval_ms: default_cache_sweep_interval_ms(),
        }
    }

    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_upload_size_mb * 1024 * 1024
    }

    pub fn content_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.content_cache_ttl_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.cache_sweep_interval_ms)
    }
}
