mod backend;
mod config;
mod entry;
mod events;
pub mod path;

pub use backend::*;
pub use config::*;
pub use entry::*;
pub use events::*;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[macro_use]
extern crate log;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RqError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("not ready: {0}")]
    NotReady(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("remote status {0}: {1}")]
    RemoteStatus(u16, String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RqError {
    pub fn from_http_status(code: u16, info: String) -> Self {
        match code {
            404 => RqError::NotFound(info),
            401 | 403 => RqError::AccessDenied(info),
            423 => RqError::AccessDenied(format!("checked out: {}", info)),
            409 => RqError::AlreadyExists(info),
            _ => RqError::RemoteStatus(code, info),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RqError::NotFound(_))
    }

    /// Transient failures are worth retrying; everything else fails fast.
    pub fn is_transient(&self) -> bool {
        match self {
            RqError::Network(_) => true,
            RqError::RemoteStatus(code, _) => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

pub type RqResult<T> = std::result::Result<T, RqError>;

impl From<std::io::Error> for RqError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => RqError::NotFound(err.to_string()),
            std::io::ErrorKind::AlreadyExists => RqError::AlreadyExists(err.to_string()),
            _ => RqError::Io(err.to_string()),
        }
    }
}

/// Pending remote mutation kind, as carried by queue entries and sync events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueueMethod {
    Put,
    Post,
    Delete,
    Move,
    Copy,
}

impl QueueMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueMethod::Put => "PUT",
            QueueMethod::Post => "POST",
            QueueMethod::Delete => "DELETE",
            QueueMethod::Move => "MOVE",
            QueueMethod::Copy => "COPY",
        }
    }
}

impl std::fmt::Display for QueueMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
