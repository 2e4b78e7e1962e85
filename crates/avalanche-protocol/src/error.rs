//! Error types for protocol operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Unknown command: 0x{0:02x}")]
    UnknownCommand(u8),

    #[error("Unknown reply: 0x{0:02x}")]
    UnknownReply(u8),

    #[error("Unknown put sub-command: 0x{0:02x}")]
    UnknownSubCommand(u8),

    #[error("Invalid key")]
    InvalidKey,

    #[error("Invalid key text: {0}")]
    InvalidKeyText(String),

    #[error("Invalid length: {0}")]
    InvalidLength(i64),

    #[error("Batch too large: {size} keys (max: {max})")]
    BatchTooLarge { size: i64, max: i64 },
}
