//! Error type shared by the reconciliation engine.
//!
//! Most failures inside the engine are recovered locally (malformed lines are
//! skipped, vanished files are pruned). What reaches a caller is either a
//! missing session or a startup failure.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cannot create data directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

impl SyncError {
    /// True when the error only means "the file is gone" (deleted between
    /// listing and stat, or between stat and read).
    pub fn is_not_found(&self) -> bool {
        match self {
            SyncError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            SyncError::SessionNotFound(_) => true,
            _ => false,
        }
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
