//! Blob storage primitives

use async_trait::async_trait;
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::SystemTime;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// Readable stream over a blob's contents
pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Writable stream appending to a blob
pub type BlobWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One stored artifact
///
/// A blob handed out by the dictionary is a shared handle: readers opened
/// from it stay usable after the dictionary drops the entry, and a memory
/// blob keeps its contents for as long as a handle exists. A file-backed
/// blob cannot be opened again once it has been removed.
#[async_trait]
pub trait Blob: Send + Sync + fmt::Debug {
    /// Current size in bytes
    fn size(&self) -> u64;

    /// Open a stream over the blob's contents
    async fn read(&self) -> Result<BlobReader>;

    /// Open a stream appending to the blob
    async fn append(&self) -> Result<BlobWriter>;

    /// Delete the backing storage
    async fn remove(&self) -> Result<()>;

    /// Record an access for external eviction policy
    async fn touch(&self) -> Result<()>;

    /// Time of the last recorded access
    fn last_access(&self) -> SystemTime;
}

/// Writer wrapper keeping a shared byte counter current
struct SizeTracker<W> {
    inner: W,
    size: Arc<AtomicU64>,
}

impl<W: AsyncWrite + Unpin> AsyncWrite for SizeTracker<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = &poll {
            self.size.fetch_add(*written as u64, Ordering::SeqCst);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

fn lock_time(time: &Mutex<SystemTime>) -> SystemTime {
    *time.lock().unwrap_or_else(PoisonError::into_inner)
}

fn set_time(time: &Mutex<SystemTime>, value: SystemTime) {
    *time.lock().unwrap_or_else(PoisonError::into_inner) = value;
}

/// Ephemeral blob held in memory
pub struct BlobMemory {
    data: Arc<RwLock<Vec<u8>>>,
    last_access: Mutex<SystemTime>,
}

impl BlobMemory {
    /// Create an empty blob
    pub fn new() -> Self {
        Self::from_vec(Vec::new())
    }

    /// Create a blob holding `data`
    pub fn from_vec(data: Vec<u8>) -> Self {
        BlobMemory {
            data: Arc::new(RwLock::new(data)),
            last_access: Mutex::new(SystemTime::now()),
        }
    }
}

impl Default for BlobMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BlobMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobMemory")
            .field("size", &self.size())
            .finish()
    }
}

/// Append stream of a `BlobMemory`
struct MemoryAppender {
    data: Arc<RwLock<Vec<u8>>>,
}

impl AsyncWrite for MemoryAppender {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.data
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl Blob for BlobMemory {
    fn size(&self) -> u64 {
        self.data.read().unwrap_or_else(PoisonError::into_inner).len() as u64
    }

    async fn read(&self) -> Result<BlobReader> {
        // Readers get a snapshot so later appends or removal never tear a read.
        let snapshot = self
            .data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Ok(Box::new(Cursor::new(snapshot)))
    }

    async fn append(&self) -> Result<BlobWriter> {
        Ok(Box::new(MemoryAppender {
            data: self.data.clone(),
        }))
    }

    /// Nothing to delete; the bytes go away with the last handle
    async fn remove(&self) -> Result<()> {
        Ok(())
    }

    async fn touch(&self) -> Result<()> {
        set_time(&self.last_access, SystemTime::now());
        Ok(())
    }

    fn last_access(&self) -> SystemTime {
        lock_time(&self.last_access)
    }
}

/// Blob persisted as a single file
pub struct BlobFile {
    path: PathBuf,
    size: Arc<AtomicU64>,
    last_access: Mutex<SystemTime>,
}

impl BlobFile {
    /// Create (or truncate) an empty file at `path`
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        fs::File::create(&path).await?;
        Ok(Self::open(path, 0, SystemTime::now()))
    }

    /// Wrap an existing file whose size and access time are already known
    pub fn open(path: impl Into<PathBuf>, size: u64, last_access: SystemTime) -> Self {
        BlobFile {
            path: path.into(),
            size: Arc::new(AtomicU64::new(size)),
            last_access: Mutex::new(last_access),
        }
    }

    /// Location of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for BlobFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobFile")
            .field("path", &self.path)
            .field("size", &self.size())
            .finish()
    }
}

#[async_trait]
impl Blob for BlobFile {
    fn size(&self) -> u64 {
        self.size.load(Ordering::SeqCst)
    }

    async fn read(&self) -> Result<BlobReader> {
        let file = fs::File::open(&self.path).await?;
        Ok(Box::new(file))
    }

    async fn append(&self) -> Result<BlobWriter> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .await?;
        Ok(Box::new(SizeTracker {
            inner: file,
            size: self.size.clone(),
        }))
    }

    async fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.size.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn touch(&self) -> Result<()> {
        let now = SystemTime::now();
        set_time(&self.last_access, now);

        // The startup scan rebuilds access times from the file, so persist it.
        let file = OpenOptions::new().write(true).open(&self.path).await?;
        let file = file.into_std().await;
        tokio::task::spawn_blocking(move || file.set_modified(now))
            .await
            .map_err(std::io::Error::other)??;
        Ok(())
    }

    fn last_access(&self) -> SystemTime {
        lock_time(&self.last_access)
    }
}
