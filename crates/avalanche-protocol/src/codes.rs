//! One-byte command and reply codes

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ProtocolError, Result};

/// Request command, the first byte of every request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Command {
    /// Liveness check (0x01)
    Ping = 0x01,
    /// Existence and size, no replication notification (0x02)
    Stat = 0x02,
    /// Fetch a blob (0x03)
    Get = 0x03,
    /// Upload a blob; followed by put sub-commands (0x04)
    Put = 0x04,
    /// Aggregate dictionary counters (0x05)
    Stats = 0x05,
    /// Enumerate every key (0x06)
    Keys = 0x06,
    /// Batch touch (0x07)
    Touch = 0x07,
    /// Batch evict (0x08)
    Evict = 0x08,
}

impl Command {
    /// Decode a command byte
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Command::Ping),
            0x02 => Ok(Command::Stat),
            0x03 => Ok(Command::Get),
            0x04 => Ok(Command::Put),
            0x05 => Ok(Command::Stats),
            0x06 => Ok(Command::Keys),
            0x07 => Ok(Command::Touch),
            0x08 => Ok(Command::Evict),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Ping => "PING",
            Command::Stat => "STAT",
            Command::Get => "GET",
            Command::Put => "PUT",
            Command::Stats => "STATS",
            Command::Keys => "KEYS",
            Command::Touch => "TOUCH",
            Command::Evict => "EVICT",
        };
        write!(f, "{}", name)
    }
}

/// Sub-command sent while a put is in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PutSubCommand {
    /// Length-prefixed chunk (0x41)
    Append = 0x41,
    /// Finalize and index the blob (0x42)
    Commit = 0x42,
    /// Abandon the blob (0x43)
    Discard = 0x43,
}

impl PutSubCommand {
    /// Decode a sub-command byte
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x41 => Ok(PutSubCommand::Append),
            0x42 => Ok(PutSubCommand::Commit),
            0x43 => Ok(PutSubCommand::Discard),
            other => Err(ProtocolError::UnknownSubCommand(other)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Reply status, the first byte of every reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Reply {
    /// Success (0x01)
    Ok = 0x01,
    /// More replies follow (0x02)
    Continue = 0x02,
    /// Logical failure; the connection stays usable (0x80)
    Failure = 0x80,
}

impl Reply {
    /// Decode a reply byte
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Reply::Ok),
            0x02 => Ok(Reply::Continue),
            0x80 => Ok(Reply::Failure),
            other => Err(ProtocolError::UnknownReply(other)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Reply for a boolean outcome
    pub fn from_success(success: bool) -> Self {
        if success {
            Reply::Ok
        } else {
            Reply::Failure
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_conversion() {
        assert_eq!(Command::from_u8(0x01), Ok(Command::Ping));
        assert_eq!(Command::from_u8(0x08), Ok(Command::Evict));
        assert_eq!(Command::Put.to_u8(), 0x04);
        assert_eq!(
            Command::from_u8(0x09),
            Err(ProtocolError::UnknownCommand(0x09))
        );
        assert!(Command::from_u8(0x00).is_err());
    }

    #[test]
    fn test_sub_command_conversion() {
        assert_eq!(PutSubCommand::from_u8(0x41), Ok(PutSubCommand::Append));
        assert_eq!(PutSubCommand::from_u8(0x43), Ok(PutSubCommand::Discard));
        assert_eq!(PutSubCommand::Commit.to_u8(), 0x42);
        // Top-level commands are not valid inside a put.
        assert!(PutSubCommand::from_u8(Command::Put.to_u8()).is_err());
    }

    #[test]
    fn test_reply_conversion() {
        assert_eq!(Reply::from_u8(0x80), Ok(Reply::Failure));
        assert_eq!(Reply::Continue.to_u8(), 0x02);
        assert_eq!(Reply::from_success(true), Reply::Ok);
        assert_eq!(Reply::from_success(false), Reply::Failure);
        assert_eq!(Reply::from_u8(0x03), Err(ProtocolError::UnknownReply(0x03)));
    }

    #[test]
    fn test_command_display() {
        assert_eq!(Command::Stats.to_string(), "STATS");
        assert_eq!(Command::Touch.to_string(), "TOUCH");
    }
}
