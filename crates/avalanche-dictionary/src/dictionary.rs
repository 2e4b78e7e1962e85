//! Local key -> blob index

use avalanche_protocol::{Key, Stats};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::blob::{Blob, BlobFile, BlobMemory};
use crate::error::{DictionaryError, Result};

/// File extension of persisted blobs
pub const BLOB_EXTENSION: &str = "blob";

/// Directory under the blobs path holding scratch and in-flight files
pub const PENDING_DIR: &str = ".pending";

/// Observer of dictionary mutations
///
/// Callbacks run synchronously on the mutating task after the map lock has
/// been released. A callback may call back into the dictionary, but must not
/// add or remove listeners.
pub trait DictionaryListener: Send + Sync {
    /// A non-raw lookup hit `key`
    fn dictionary_get(&self, _key: &Key) {}

    /// `key` was inserted or overwritten
    fn dictionary_put(&self, _key: &Key, _blob: &Arc<dyn Blob>) {}

    /// `key` was removed
    fn dictionary_remove(&self, _key: &Key) {}
}

/// Handle returned by `add_listener`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Indexed blob with the size it was accounted at
struct Entry {
    blob: Arc<dyn Blob>,
    size: u64,
}

/// Map and counters, always mutated together
#[derive(Default)]
struct Entries {
    blobs: HashMap<Key, Entry>,
    stats: Stats,
}

impl Entries {
    fn insert(&mut self, key: Key, blob: Arc<dyn Blob>) {
        let size = blob.size();
        if let Some(old) = self.blobs.insert(key, Entry { blob, size }) {
            self.stats.blob_count -= 1;
            self.stats.memory_usage -= old.size;
        }
        self.stats.blob_count += 1;
        self.stats.memory_usage += size;
    }

    fn remove(&mut self, key: &Key) {
        if let Some(old) = self.blobs.remove(key) {
            self.stats.blob_count -= 1;
            self.stats.memory_usage -= old.size;
        }
    }
}

/// Thread-safe key -> blob store with listener notification
///
/// `put` overwrites silently; `put_new` refuses to replace a live key.
pub struct Dictionary {
    blobs_path: Option<PathBuf>,
    entries: RwLock<Entries>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn DictionaryListener>)>>,
    next_listener: AtomicU64,
}

impl Dictionary {
    /// Create an empty memory-backed dictionary
    pub fn new() -> Self {
        Self::with_entries(None, Entries::default())
    }

    /// Create a dictionary, disk-backed when `blobs_path` is given
    pub async fn create(blobs_path: Option<PathBuf>) -> Result<Self> {
        match blobs_path {
            Some(path) => Self::open(path).await,
            None => Ok(Self::new()),
        }
    }

    /// Open a disk-backed dictionary, indexing every `<key>.blob` already
    /// present under `blobs_path`
    pub async fn open(blobs_path: impl Into<PathBuf>) -> Result<Self> {
        let blobs_path = blobs_path.into();

        fs::create_dir_all(&blobs_path).await.map_err(|e| {
            DictionaryError::BlobsPath(format!("{}: {}", blobs_path.display(), e))
        })?;

        // Anything left pending belongs to puts that never committed.
        let pending = blobs_path.join(PENDING_DIR);
        if fs::metadata(&pending).await.is_ok() {
            fs::remove_dir_all(&pending).await?;
        }
        fs::create_dir_all(&pending).await.map_err(|e| {
            DictionaryError::BlobsPath(format!("{}: {}", pending.display(), e))
        })?;

        let entries = Self::scan(&blobs_path).await?;
        info!(
            "Opened {} with {} blobs ({} bytes)",
            blobs_path.display(),
            entries.stats.blob_count,
            entries.stats.memory_usage
        );

        Ok(Self::with_entries(Some(blobs_path), entries))
    }

    fn with_entries(blobs_path: Option<PathBuf>, entries: Entries) -> Self {
        Dictionary {
            blobs_path,
            entries: RwLock::new(entries),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    async fn scan(blobs_path: &Path) -> Result<Entries> {
        let mut entries = Entries::default();
        let mut dir = fs::read_dir(blobs_path).await?;

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXTENSION) {
                continue;
            }

            let key = match path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<Key>().ok())
            {
                Some(key) => key,
                None => {
                    debug!("Skipping unrecognised blob file {}", path.display());
                    continue;
                }
            };

            let metadata = match entry.metadata().await {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => continue,
                Err(e) => {
                    warn!("Unable to stat {}: {}", path.display(), e);
                    continue;
                }
            };

            let last_access = metadata
                .modified()
                .or_else(|_| metadata.accessed())
                .unwrap_or_else(|_| SystemTime::now());

            entries.insert(
                key,
                Arc::new(BlobFile::open(path, metadata.len(), last_access)),
            );
        }

        Ok(entries)
    }

    /// Directory backing this dictionary, if any
    pub fn blobs_path(&self) -> Option<&Path> {
        self.blobs_path.as_deref()
    }

    fn blob_path(&self, key: &Key) -> Option<PathBuf> {
        self.blobs_path
            .as_ref()
            .map(|path| path.join(format!("{}.{}", key, BLOB_EXTENSION)))
    }

    fn pending_path(&self) -> Option<PathBuf> {
        self.blobs_path.as_ref().map(|path| {
            path.join(PENDING_DIR)
                .join(format!("{}.tmp", uuid::Uuid::new_v4()))
        })
    }

    /// Create a fresh scratch blob for an in-progress upload
    ///
    /// Disk-backed dictionaries stage uploads in files so that a large blob
    /// is never held in memory. The scratch blob is not indexed; the caller
    /// hands it to `release_blob` once it has been committed or abandoned.
    pub async fn create_blob(&self) -> Result<Arc<dyn Blob>> {
        match self.pending_path() {
            Some(path) => Ok(Arc::new(BlobFile::create(path).await?)),
            None => Ok(Arc::new(BlobMemory::new())),
        }
    }

    /// Release a scratch blob from `create_blob` once it has been committed
    /// or abandoned
    ///
    /// Memory scratch blobs may have been indexed as-is by `put`, so they are
    /// only dropped; disk scratch files are always copies and get deleted.
    pub async fn release_blob(&self, blob: Arc<dyn Blob>) {
        if self.blobs_path.is_none() {
            return;
        }
        if let Err(e) = blob.remove().await {
            warn!("Unable to remove scratch blob {:?}: {}", blob, e);
        }
    }

    /// Look up `key`
    ///
    /// Fires `dictionary_get` on a hit unless `raw` is set.
    pub async fn get(&self, key: &Key, raw: bool) -> Option<Arc<dyn Blob>> {
        let blob = self
            .entries
            .read()
            .await
            .blobs
            .get(key)
            .map(|entry| entry.blob.clone());

        if blob.is_some() && !raw {
            self.notify(|listener| listener.dictionary_get(key));
        }

        blob
    }

    /// Insert or overwrite `key`
    ///
    /// When disk-backed, the source blob is first copied in full into a
    /// pending file, which is renamed into place while the map is locked; no
    /// reader can observe a partially written blob. Fires `dictionary_put`
    /// unless `raw` is set.
    pub async fn put(&self, key: Key, blob: Arc<dyn Blob>, raw: bool) -> Result<()> {
        self.store(key, blob, raw, true).await
    }

    /// Insert `key` only if it is absent
    ///
    /// The presence check and the insert happen under one hold of the map
    /// lock, so of several concurrent callers for one key exactly one
    /// succeeds; the others get `AlreadyExists` and leave nothing behind.
    pub async fn put_new(&self, key: Key, blob: Arc<dyn Blob>, raw: bool) -> Result<()> {
        self.store(key, blob, raw, false).await
    }

    async fn store(&self, key: Key, blob: Arc<dyn Blob>, raw: bool, replace: bool) -> Result<()> {
        if !key.is_valid() {
            return Err(DictionaryError::InvalidKey);
        }

        let stored: Arc<dyn Blob> = match (self.pending_path(), self.blob_path(&key)) {
            (Some(pending), Some(target)) => {
                let size = match Self::copy_to_file(blob.as_ref(), &pending).await {
                    Ok(size) => size,
                    Err(e) => {
                        let _ = fs::remove_file(&pending).await;
                        return Err(e);
                    }
                };

                let mut entries = self.entries.write().await;
                if !replace && entries.blobs.contains_key(&key) {
                    drop(entries);
                    let _ = fs::remove_file(&pending).await;
                    return Err(DictionaryError::AlreadyExists);
                }
                if let Err(e) = fs::rename(&pending, &target).await {
                    drop(entries);
                    let _ = fs::remove_file(&pending).await;
                    return Err(e.into());
                }

                let stored: Arc<dyn Blob> =
                    Arc::new(BlobFile::open(target, size, SystemTime::now()));
                entries.insert(key, stored.clone());
                stored
            }
            _ => {
                let mut entries = self.entries.write().await;
                if !replace && entries.blobs.contains_key(&key) {
                    return Err(DictionaryError::AlreadyExists);
                }
                entries.insert(key, blob.clone());
                blob
            }
        };

        debug!("Put {} ({} bytes)", key, stored.size());

        if !raw {
            self.notify(|listener| listener.dictionary_put(&key, &stored));
        }

        Ok(())
    }

    async fn copy_to_file(source: &dyn Blob, path: &Path) -> Result<u64> {
        let mut reader = source.read().await?;
        let mut file = fs::File::create(path).await?;
        let size = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(size)
    }

    /// Remove `key` and delete its backing storage
    ///
    /// Fails without touching the index if the key is absent or the blob's
    /// storage cannot be deleted.
    pub async fn remove(&self, key: &Key) -> Result<()> {
        {
            let mut entries = self.entries.write().await;

            let blob = entries
                .blobs
                .get(key)
                .map(|entry| entry.blob.clone())
                .ok_or(DictionaryError::KeyNotFound)?;

            blob.remove().await?;
            entries.remove(key);
        }

        debug!("Removed {}", key);
        self.notify(|listener| listener.dictionary_remove(key));

        Ok(())
    }

    /// Point-in-time copy of every live key
    pub async fn snapshot_keys(&self) -> Vec<Key> {
        self.entries.read().await.blobs.keys().copied().collect()
    }

    /// Aggregate counters
    pub async fn stats(&self) -> Stats {
        self.entries.read().await.stats
    }

    /// Register a listener
    pub fn add_listener(&self, listener: Arc<dyn DictionaryListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Unregister a listener; returns false if it was not registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn notify<F>(&self, event: F)
    where
        F: Fn(&dyn DictionaryListener),
    {
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, listener) in listeners.iter() {
            event(listener.as_ref());
        }
    }
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[derive(Default)]
    struct RecordingListener {
        events: Mutex<Vec<String>>,
    }

    impl RecordingListener {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl DictionaryListener for RecordingListener {
        fn dictionary_get(&self, key: &Key) {
            self.events.lock().unwrap().push(format!("get {}", key));
        }

        fn dictionary_put(&self, key: &Key, _blob: &Arc<dyn Blob>) {
            self.events.lock().unwrap().push(format!("put {}", key));
        }

        fn dictionary_remove(&self, key: &Key) {
            self.events.lock().unwrap().push(format!("remove {}", key));
        }
    }

    fn memory_blob(data: &[u8]) -> Arc<dyn Blob> {
        Arc::new(BlobMemory::from_vec(data.to_vec()))
    }

    async fn contents(blob: &Arc<dyn Blob>) -> Vec<u8> {
        let mut out = Vec::new();
        blob.read().await.unwrap().read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_new_dictionary() {
        let dictionary = Dictionary::new();
        assert_eq!(dictionary.stats().await, Stats::default());
        assert!(dictionary.snapshot_keys().await.is_empty());
        assert!(dictionary.blobs_path().is_none());
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let dictionary = Dictionary::new();
        let key = Key::new(1, 2, 3, 4);

        dictionary.put(key, memory_blob(b"payload"), false).await.unwrap();

        let blob = dictionary.get(&key, false).await.unwrap();
        assert_eq!(contents(&blob).await, b"payload");
        assert!(dictionary.get(&Key::new(9, 9, 9, 9), false).await.is_none());
    }

    #[tokio::test]
    async fn test_put_rejects_invalid_key() {
        let dictionary = Dictionary::new();
        let result = dictionary.put(Key::INVALID, memory_blob(b"x"), false).await;
        assert!(matches!(result, Err(DictionaryError::InvalidKey)));
        assert_eq!(dictionary.stats().await.blob_count, 0);
    }

    #[tokio::test]
    async fn test_stats_track_puts_and_removes() {
        let dictionary = Dictionary::new();
        let a = Key::new(0, 0, 0, 1);
        let b = Key::new(0, 0, 0, 2);

        dictionary.put(a, memory_blob(&[0u8; 10]), false).await.unwrap();
        dictionary.put(b, memory_blob(&[0u8; 32]), false).await.unwrap();
        assert_eq!(
            dictionary.stats().await,
            Stats {
                blob_count: 2,
                memory_usage: 42
            }
        );

        // Overwriting replaces the accounted size.
        dictionary.put(a, memory_blob(&[0u8; 5]), false).await.unwrap();
        assert_eq!(
            dictionary.stats().await,
            Stats {
                blob_count: 2,
                memory_usage: 37
            }
        );

        dictionary.remove(&b).await.unwrap();
        assert_eq!(
            dictionary.stats().await,
            Stats {
                blob_count: 1,
                memory_usage: 5
            }
        );
    }

    #[tokio::test]
    async fn test_remove_missing_key() {
        let dictionary = Dictionary::new();
        let listener = Arc::new(RecordingListener::default());
        dictionary.add_listener(listener.clone());

        let result = dictionary.remove(&Key::new(1, 1, 1, 1)).await;
        assert!(matches!(result, Err(DictionaryError::KeyNotFound)));
        assert!(listener.events().is_empty());
    }

    #[tokio::test]
    async fn test_listener_events() {
        let dictionary = Dictionary::new();
        let listener = Arc::new(RecordingListener::default());
        let id = dictionary.add_listener(listener.clone());
        let key = Key::new(0, 0, 0, 7);

        dictionary.put(key, memory_blob(b"a"), false).await.unwrap();
        dictionary.get(&key, false).await.unwrap();
        dictionary.get(&key, true).await.unwrap();
        dictionary.put(key, memory_blob(b"b"), true).await.unwrap();
        dictionary.remove(&key).await.unwrap();

        assert_eq!(
            listener.events(),
            vec![
                format!("put {}", key),
                format!("get {}", key),
                format!("remove {}", key),
            ]
        );

        assert!(dictionary.remove_listener(id));
        assert!(!dictionary.remove_listener(id));
        assert_eq!(dictionary.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_is_detached() {
        let dictionary = Dictionary::new();
        for i in 1..=3 {
            dictionary
                .put(Key::new(0, 0, 0, i), memory_blob(b"x"), true)
                .await
                .unwrap();
        }

        let mut snapshot = dictionary.snapshot_keys().await;
        dictionary.remove(&Key::new(0, 0, 0, 1)).await.unwrap();

        snapshot.sort();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0], Key::new(0, 0, 0, 1));
        assert_eq!(dictionary.snapshot_keys().await.len(), 2);
    }

    #[tokio::test]
    async fn test_disk_backed_put_persists() {
        let dir = tempfile::tempdir().unwrap();
        let key = Key::new(1, 2, 3, 4);

        {
            let dictionary = Dictionary::open(dir.path()).await.unwrap();
            let scratch = dictionary.create_blob().await.unwrap();
            {
                use tokio::io::AsyncWriteExt;
                let mut writer = scratch.append().await.unwrap();
                writer.write_all(b"persisted").await.unwrap();
                writer.flush().await.unwrap();
            }

            dictionary.put(key, scratch.clone(), false).await.unwrap();
            dictionary.release_blob(scratch).await;

            let path = dir.path().join(format!("{}.blob", key));
            assert_eq!(std::fs::read(&path).unwrap(), b"persisted");
        }

        // Reopening rebuilds the index from the directory.
        let dictionary = Dictionary::open(dir.path()).await.unwrap();
        assert_eq!(
            dictionary.stats().await,
            Stats {
                blob_count: 1,
                memory_usage: 9
            }
        );
        let blob = dictionary.get(&key, true).await.unwrap();
        assert_eq!(contents(&blob).await, b"persisted");

        // No scratch files survive.
        let pending = std::fs::read_dir(dir.path().join(PENDING_DIR)).unwrap();
        assert_eq!(pending.count(), 0);
    }

    #[tokio::test]
    async fn test_scan_skips_unparsable_names() {
        let dir = tempfile::tempdir().unwrap();
        let key = Key::new(0, 0, 0, 42);
        std::fs::write(dir.path().join(format!("{}.blob", key)), b"ok").unwrap();
        std::fs::write(dir.path().join("not-a-key.blob"), b"junk").unwrap();
        std::fs::write(dir.path().join("00000000000000000000000000000000.blob"), b"zero").unwrap();
        std::fs::write(dir.path().join("readme.txt"), b"ignored").unwrap();

        let dictionary = Dictionary::open(dir.path()).await.unwrap();
        assert_eq!(dictionary.snapshot_keys().await, vec![key]);
        assert_eq!(dictionary.stats().await.memory_usage, 2);
    }

    #[tokio::test]
    async fn test_disk_backed_remove_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let dictionary = Dictionary::open(dir.path()).await.unwrap();
        let key = Key::new(5, 5, 5, 5);

        dictionary.put(key, memory_blob(b"bytes"), false).await.unwrap();
        let path = dir.path().join(format!("{}.blob", key));
        assert!(path.exists());

        dictionary.remove(&key).await.unwrap();
        assert!(!path.exists());
        assert_eq!(dictionary.stats().await, Stats::default());
    }

    #[tokio::test]
    async fn test_open_fails_on_unusable_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, b"").unwrap();

        let result = Dictionary::open(file.join("blobs")).await;
        assert!(matches!(result, Err(DictionaryError::BlobsPath(_))));
    }

    #[tokio::test]
    async fn test_memory_scratch_survives_release() {
        let dictionary = Dictionary::new();
        let key = Key::new(0, 1, 0, 1);
        let scratch = dictionary.create_blob().await.unwrap();
        {
            use tokio::io::AsyncWriteExt;
            let mut writer = scratch.append().await.unwrap();
            writer.write_all(b"kept").await.unwrap();
        }

        dictionary.put(key, scratch.clone(), false).await.unwrap();
        dictionary.release_blob(scratch).await;

        let blob = dictionary.get(&key, true).await.unwrap();
        assert_eq!(contents(&blob).await, b"kept");
    }

    #[tokio::test]
    async fn test_listener_may_reenter_dictionary() {
        struct Reentrant {
            dictionary: std::sync::Weak<Dictionary>,
            seen: AtomicU64,
        }

        impl DictionaryListener for Reentrant {
            fn dictionary_put(&self, _key: &Key, _blob: &Arc<dyn Blob>) {
                // Taking the map lock from inside a callback must not deadlock.
                if let Some(dictionary) = self.dictionary.upgrade() {
                    if dictionary.entries.try_read().is_ok() {
                        self.seen.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        }

        let dictionary = Arc::new(Dictionary::new());
        let listener = Arc::new(Reentrant {
            dictionary: Arc::downgrade(&dictionary),
            seen: AtomicU64::new(0),
        });
        dictionary.add_listener(listener.clone());

        dictionary
            .put(Key::new(1, 0, 0, 0), memory_blob(b"x"), false)
            .await
            .unwrap();
        assert_eq!(listener.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_put_new_refuses_live_key() {
        let dictionary = Dictionary::new();
        let listener = Arc::new(RecordingListener::default());
        dictionary.add_listener(listener.clone());
        let key = Key::new(0, 0, 1, 0);

        dictionary.put_new(key, memory_blob(b"first"), false).await.unwrap();
        let result = dictionary.put_new(key, memory_blob(b"second"), false).await;
        assert!(matches!(result, Err(DictionaryError::AlreadyExists)));

        let blob = dictionary.get(&key, true).await.unwrap();
        assert_eq!(contents(&blob).await, b"first");
        assert_eq!(dictionary.stats().await.blob_count, 1);
        assert_eq!(listener.events(), vec![format!("put {}", key)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_put_new_has_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        let dictionary = Arc::new(Dictionary::create(Some(dir.path().to_path_buf())).await.unwrap());
        let key = Key::new(0, 0, 1, 1);

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let dictionary = dictionary.clone();
            tasks.push(tokio::spawn(async move {
                dictionary
                    .put_new(key, memory_blob(&vec![i; 200_000]), true)
                    .await
                    .is_ok()
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(dictionary.stats().await.memory_usage, 200_000);

        let mut pending = std::fs::read_dir(dir.path().join(PENDING_DIR)).unwrap();
        assert!(pending.next().is_none());
    }

    #[tokio::test]
    async fn test_handle_outlives_remove() {
        let dictionary = Dictionary::new();
        let key = Key::new(0, 0, 1, 2);
        dictionary.put(key, memory_blob(b"payload"), true).await.unwrap();

        let blob = dictionary.get(&key, true).await.unwrap();
        dictionary.remove(&key).await.unwrap();

        assert!(dictionary.get(&key, true).await.is_none());
        assert_eq!(blob.size(), 7);
        assert_eq!(contents(&blob).await, b"payload");
    }
}
