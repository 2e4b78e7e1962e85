//! Content key type

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ProtocolError, Result};

/// Size of a key in bytes (16 bytes / 128 bits)
pub const KEY_SIZE: usize = 16;

/// A 128-bit content key addressing one blob
///
/// Keys are opaque to the cache: they are derived by the caller (for example
/// from a content hash and a namespace) and compared bitwise. The all-zero
/// key is the invalid sentinel and is never sent over the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord, Default)]
pub struct Key([u8; KEY_SIZE]);

impl Key {
    /// The invalid key
    pub const INVALID: Key = Key([0u8; KEY_SIZE]);

    /// Create a key from four 32-bit words
    pub fn new(k0: u32, k1: u32, k2: u32, k3: u32) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        bytes[0..4].copy_from_slice(&k0.to_be_bytes());
        bytes[4..8].copy_from_slice(&k1.to_be_bytes());
        bytes[8..12].copy_from_slice(&k2.to_be_bytes());
        bytes[12..16].copy_from_slice(&k3.to_be_bytes());
        Key(bytes)
    }

    /// Create a key from a byte array
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Key(bytes)
    }

    /// Get the bytes of this key
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Check that this is not the invalid sentinel
    pub fn is_valid(&self) -> bool {
        self.0 != [0u8; KEY_SIZE]
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    ///
    /// Parsing succeeds only for exactly 32 hex digits that do not decode
    /// to the invalid key.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| ProtocolError::InvalidKeyText(e.to_string()))?;

        if bytes.len() != KEY_SIZE {
            return Err(ProtocolError::InvalidKeyText(format!(
                "expected {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }

        let mut arr = [0u8; KEY_SIZE];
        arr.copy_from_slice(&bytes);

        let key = Key(arr);
        if !key.is_valid() {
            return Err(ProtocolError::InvalidKey);
        }
        Ok(key)
    }
}

impl FromStr for Key {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Key::from_hex(s)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.to_hex())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}
