//! Avalanche Dictionary
//!
//! The local key -> blob store of one cache node:
//! - `Blob`: one stored artifact, memory-backed or file-backed
//! - `Dictionary`: the thread-safe index with aggregate stats
//! - `DictionaryListener`: synchronous observers of get/put/remove events

pub mod blob;
pub mod dictionary;
pub mod error;

pub use avalanche_protocol::{Key, Stats};
pub use blob::{Blob, BlobFile, BlobMemory, BlobReader, BlobWriter};
pub use dictionary::{Dictionary, DictionaryListener, ListenerId, BLOB_EXTENSION, PENDING_DIR};
pub use error::{DictionaryError, Result};
