//! Error taxonomy for backup and restore operations.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transform hook {hook} failed on {file}: {message}")]
    Transform {
        hook: String,
        file: String,
        message: String,
    },

    #[error("transform hook not found: {0}")]
    HookNotFound(String),

    #[error("invalid transform hook name: {0:?}")]
    InvalidHookName(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("backup {name} not found in {scope}")]
    BackupNotFound { scope: String, name: String },

    #[error("no backups found for {0}")]
    NoBackups(String),

    #[error("{0} already running")]
    AlreadyRunning(String),

    #[error("backup {0} has no MANIFEST")]
    ManifestMissing(String),

    #[error("invalid MANIFEST: {0}")]
    ManifestInvalid(String),

    #[error("size mismatch for {file}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        file: String,
        expected: u64,
        actual: u64,
    },

    #[error("checksum mismatch for {file}")]
    HashMismatch { file: String },

    #[error("backup is not usable, aborting it: {0}")]
    NotUsable(#[source] Box<EngineError>),

    #[error("operation cancelled")]
    Cancelled,

    #[error("data directory {0} holds an incomplete restore")]
    RestoreIncomplete(String),
}

impl EngineError {
    /// Wrap a storage backend failure with the operation it interrupted.
    pub fn storage(operation: &str, err: impl std::fmt::Display) -> Self {
        EngineError::Storage(format!("{}: {}", operation, err))
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            EngineError::Cancelled => true,
            EngineError::NotUsable(inner) => inner.is_cancelled(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
