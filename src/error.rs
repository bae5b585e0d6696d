use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum SyncError {
    #[error("invalid data source key: {0}")]
    InvalidDataSourceKey(String),

    #[error("unknown data source: {0}")]
    UnknownDataSource(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("invalid sort: {0}")]
    InvalidSort(String),

    #[error("invalid value for field {field}: {value}")]
    InvalidFieldValue { field: String, value: String },

    #[error("missing config file msi-sync.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("remote request failed: {0}")]
    Transport(String),

    #[error("remote returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("failed to decode payload: {0}")]
    Decode(String),

    #[error("batch insert failed: {0}")]
    BatchInsert(String),

    #[error("store query failed: {0}")]
    Store(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("fetch task for {0} was already started")]
    TaskAlreadyStarted(String),
}

impl SyncError {
    /// Remote-side failures, as opposed to local validation or storage errors.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::Status { .. } | SyncError::Decode(_)
        )
    }
}
