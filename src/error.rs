use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum FetchError {
    #[error("invalid genome id: {0}")]
    InvalidGenomeId(String),

    #[error("invalid artifact kind: {0}")]
    InvalidArtifactKind(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("connection to {host} failed: {message}")]
    Connection { host: String, message: String },

    #[error("remote size unavailable for {0}")]
    SizeUnknown(String),

    #[error("FTP server replied {code}: {message}")]
    Protocol { code: u16, message: String },

    #[error("transfer of {path} ended at {actual} bytes, expected {expected}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("local write failed for {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to read table {path}: {message}")]
    TableParse { path: PathBuf, message: String },

    #[error("missing column in table: {0}")]
    MissingColumn(String),

    #[error("external process failed: {0}")]
    Process(String),

    #[error("background task `{0}` panicked")]
    TaskPanicked(String),
}

impl FetchError {
    pub(crate) fn io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        FetchError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub(crate) fn connection(host: &str, err: impl std::fmt::Display) -> Self {
        FetchError::Connection {
            host: host.to_string(),
            message: err.to_string(),
        }
    }
}
