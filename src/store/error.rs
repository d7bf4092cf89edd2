use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization/deserialization error: {0}")]
    Serialization(String),

    #[error("found something that is not a directory at {0}, either delete it or specify a different location")]
    NotADirectory(PathBuf),

    #[error("{failed} of {total} key writes failed, first error: {first}")]
    WriteFailed {
        failed: usize,
        total: usize,
        first: String,
    },

    #[error("transaction commit failed after {attempts} attempts: {source}")]
    CommitFailed {
        attempts: u32,
        #[source]
        source: Box<StoreError>,
    },
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
