//! Avalanche Protocol Module
//!
//! This module defines the wire contract shared by the Avalanche client,
//! server and peer replicator:
//! - `Key`: the 128-bit content key blobs are addressed by
//! - `Command`, `Reply` and `PutSubCommand`: the one-byte codes that open
//!   every request and reply
//! - `wire`: big-endian framing helpers for keys, lengths and stats

pub mod codes;
pub mod error;
pub mod key;
pub mod wire;

pub use codes::{Command, PutSubCommand, Reply};
pub use error::{ProtocolError, Result};
pub use key::{Key, KEY_SIZE};
pub use wire::Stats;

/// Default TCP port of an Avalanche server
pub const DEFAULT_PORT: u16 = 40001;

/// Service type published to discovery by every Avalanche server
pub const SERVICE_TYPE: &str = "Traktor.Avalanche";

/// Largest chunk carried by one `PutAppend` sub-command (1 MiB)
pub const MAX_CHUNK_SIZE: i64 = 1024 * 1024;

/// Largest number of keys carried by one `Touch`/`Evict` batch
pub const MAX_BATCH_KEYS: i64 = 65_536;
