//! Error taxonomy for hashing, discovery and scan lifecycle

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Permission denied: {0}")]
    Permission(PathBuf),

    #[error("Scan not found: {0}")]
    ScanNotFound(u64),

    #[error("Hash engine has been stopped")]
    EngineStopped,

    #[error("Scan registry is shutting down")]
    ShuttingDown,

    #[error("Scan failed: {0}")]
    StructuralFailure(String),

    #[error("Invalid scan configuration: {0}")]
    InvalidConfig(String),

    #[error("Unsupported hash algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ScanError {
    /// Classify an IO error raised while touching `path`
    pub fn from_io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        let path = path.into();
        match err.kind() {
            std::io::ErrorKind::NotFound => ScanError::NotFound(path),
            std::io::ErrorKind::PermissionDenied => ScanError::Permission(path),
            _ => ScanError::Io { path, source: err },
        }
    }

    /// Whether the error is confined to a single file or subtree
    pub fn is_per_file(&self) -> bool {
        matches!(
            self,
            ScanError::NotFound(_) | ScanError::Io { .. } | ScanError::Permission(_)
        )
    }
}
