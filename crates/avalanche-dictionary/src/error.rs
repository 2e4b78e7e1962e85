//! Dictionary error types

use thiserror::Error;

/// Dictionary-specific errors
#[derive(Error, Debug)]
pub enum DictionaryError {
    #[error("Key not found")]
    KeyNotFound,

    #[error("Key already present")]
    AlreadyExists,

    #[error("Invalid key")]
    InvalidKey,

    #[error("Blobs path unusable: {0}")]
    BlobsPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for dictionary operations
pub type Result<T> = std::result::Result<T, DictionaryError>;
