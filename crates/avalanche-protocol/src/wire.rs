//! Wire framing helpers
//!
//! Every multi-byte integer is big-endian. Lengths and counts travel as
//! signed 64-bit values; a key is its 16 raw bytes.
//!
//! Request/reply bodies:
//! - `Stat`:  key -> `Ok` size | `Failure`
//! - `Get`:   key -> `Ok` size bytes.. | `Failure`
//! - `Put`:   key -> `Ok` | `Failure`, then `PutAppend` len bytes.. / `PutCommit` / `PutDiscard`
//! - `Stats`: -> `Ok` blob_count memory_usage
//! - `Keys`:  -> `Ok` count key..
//! - `Touch`/`Evict`: count key.. -> `Continue`* (`Ok` | `Failure`)

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codes::{Command, PutSubCommand, Reply};
use crate::error::{ProtocolError, Result};
use crate::key::{Key, KEY_SIZE};
use crate::{MAX_BATCH_KEYS, MAX_CHUNK_SIZE};

/// Aggregate dictionary counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Stats {
    /// Number of live blobs
    pub blob_count: u64,

    /// Sum of the sizes of all live blobs, in bytes
    pub memory_usage: u64,
}

/// Read one raw key; validity is left to the caller
pub async fn read_key<R>(reader: &mut R) -> std::io::Result<Key>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = [0u8; KEY_SIZE];
    reader.read_exact(&mut bytes).await?;
    Ok(Key::from_bytes(bytes))
}

/// Write one key
pub async fn write_key<W>(writer: &mut W, key: &Key) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(key.as_bytes()).await
}

/// Write a count followed by every key
pub async fn write_keys<W>(writer: &mut W, keys: &[Key]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_i64(keys.len() as i64).await?;
    for key in keys {
        write_key(writer, key).await?;
    }
    Ok(())
}

/// Write a request command byte
pub async fn write_command<W>(writer: &mut W, command: Command) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u8(command.to_u8()).await
}

/// Write a put sub-command byte
pub async fn write_sub_command<W>(writer: &mut W, sub: PutSubCommand) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u8(sub.to_u8()).await
}

/// Write a reply status byte
pub async fn write_reply<W>(writer: &mut W, reply: Reply) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u8(reply.to_u8()).await
}

/// Write the body of a `Stats` reply
pub async fn write_stats<W>(writer: &mut W, stats: &Stats) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_i64(stats.blob_count as i64).await?;
    writer.write_i64(stats.memory_usage as i64).await
}

/// Read the body of a `Stats` reply
pub async fn read_stats<R>(reader: &mut R) -> std::io::Result<Stats>
where
    R: AsyncRead + Unpin,
{
    let blob_count = reader.read_i64().await?;
    let memory_usage = reader.read_i64().await?;
    Ok(Stats {
        blob_count: blob_count.max(0) as u64,
        memory_usage: memory_usage.max(0) as u64,
    })
}

/// Validate the length prefix of a `PutAppend` chunk
pub fn check_chunk_length(length: i64) -> Result<usize> {
    if !(0..=MAX_CHUNK_SIZE).contains(&length) {
        return Err(ProtocolError::InvalidLength(length));
    }
    Ok(length as usize)
}

/// Validate the key count of a `Touch`/`Evict` batch
pub fn check_key_count(count: i64) -> Result<usize> {
    if count < 0 {
        return Err(ProtocolError::InvalidLength(count));
    }
    if count > MAX_BATCH_KEYS {
        return Err(ProtocolError::BatchTooLarge {
            size: count,
            max: MAX_BATCH_KEYS,
        });
    }
    Ok(count as usize)
}

/// Validate a blob size announced by a `Stat` or `Get` reply
pub fn check_blob_size(size: i64) -> Result<u64> {
    if size < 0 {
        return Err(ProtocolError::InvalidLength(size));
    }
    Ok(size as u64)
}
