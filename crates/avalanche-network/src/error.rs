//! Network error types

use thiserror::Error;

/// Network-specific errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Unexpected reply: 0x{0:02x}")]
    UnexpectedReply(u8),

    #[error("Request rejected by server")]
    Rejected,

    #[error("Stream closed")]
    StreamClosed,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] avalanche_protocol::ProtocolError),

    #[error("Dictionary error: {0}")]
    Dictionary(#[from] avalanche_dictionary::DictionaryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;

impl From<tokio::time::error::Elapsed> for NetworkError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        NetworkError::Timeout
    }
}

impl From<bincode::Error> for NetworkError {
    fn from(e: bincode::Error) -> Self {
        NetworkError::Serialization(e.to_string())
    }
}
