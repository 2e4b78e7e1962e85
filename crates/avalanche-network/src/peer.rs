//! Background replication to one remote server
//!
//! A `Peer` first pushes every local key the remote is missing, then keeps
//! pushing keys as they are put locally. Keys queued by the dictionary
//! listener are swapped out of the queue in one go, so puts keep queueing
//! while a batch is being transferred.

use avalanche_dictionary::{Blob, Dictionary, DictionaryListener, Key, ListenerId};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::error::Result;

/// Upper bound on one idle wait before the stop flag is checked again
const WAIT_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Default)]
struct PeerState {
    queue: Mutex<Vec<Key>>,
    event: Notify,
    stop: AtomicBool,
    finished: AtomicBool,
    replicated: AtomicU64,
}

impl PeerState {
    fn enqueue(&self, key: Key) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(key);
        self.event.notify_one();
    }

    fn take_queue(&self) -> Vec<Key> {
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Queues every local put for the worker
struct PeerListener {
    state: Arc<PeerState>,
}

impl DictionaryListener for PeerListener {
    fn dictionary_put(&self, key: &Key, _blob: &Arc<dyn Blob>) {
        self.state.enqueue(*key);
    }
}

/// Replicator for one remote server
///
/// Stop a peer with `shutdown`, which lets the current transfer finish and
/// joins the worker before the listener is released. Dropping a `Peer`
/// aborts the worker mid-transfer instead.
pub struct Peer {
    address: SocketAddr,
    dictionary: Arc<Dictionary>,
    listener: ListenerId,
    state: Arc<PeerState>,
    task: Option<JoinHandle<()>>,
}

impl Peer {
    /// Register with `dictionary` and start replicating to `client`'s server
    pub fn spawn(handle: &Handle, dictionary: Arc<Dictionary>, client: Client) -> Self {
        let address = client.address();
        let state = Arc::new(PeerState::default());

        // Registered before the initial snapshot so no put can fall between
        // the two; a key seen twice is skipped by the remote check.
        let listener = dictionary.add_listener(Arc::new(PeerListener {
            state: state.clone(),
        }));

        let worker = Worker {
            dictionary: dictionary.clone(),
            client,
            state: state.clone(),
        };
        let task = handle.spawn(worker.run());

        info!("Peer {} added", address);

        Peer {
            address,
            dictionary,
            listener,
            state,
            task: Some(task),
        }
    }

    /// Address of the remote server
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Blobs pushed to the remote so far
    pub fn replicated_count(&self) -> u64 {
        self.state.replicated.load(Ordering::SeqCst)
    }

    /// Keys waiting for the worker
    pub fn pending_count(&self) -> usize {
        self.state
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::SeqCst)
    }

    /// Stop the worker after its current transfer and wait for it
    pub async fn shutdown(mut self) {
        self.state.stop.store(true, Ordering::SeqCst);
        self.state.event.notify_one();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            self.state.stop.store(true, Ordering::SeqCst);
            task.abort();
        }
        self.dictionary.remove_listener(self.listener);
        info!("Peer {} removed", self.address);
    }
}

struct Worker {
    dictionary: Arc<Dictionary>,
    client: Client,
    state: Arc<PeerState>,
}

impl Worker {
    async fn run(self) {
        let keys = self.dictionary.snapshot_keys().await;
        debug!(
            "Peer {}: initial sync of {} keys",
            self.client.address(),
            keys.len()
        );
        self.replicate_all(keys).await;

        while !self.state.stopping() {
            let batch = self.state.take_queue();
            if batch.is_empty() {
                let _ = tokio::time::timeout(WAIT_INTERVAL, self.state.event.notified()).await;
                continue;
            }
            self.replicate_all(batch).await;
        }

        self.client.disconnect();
        self.state.finished.store(true, Ordering::SeqCst);
    }

    async fn replicate_all(&self, keys: Vec<Key>) {
        for key in keys {
            if self.state.stopping() {
                return;
            }
            match self.replicate(&key).await {
                Ok(true) => {
                    self.state.replicated.fetch_add(1, Ordering::SeqCst);
                    debug!("Replicated {} to {}", key, self.client.address());
                }
                Ok(false) => {}
                Err(e) => warn!(
                    "Replicating {} to {} failed: {}",
                    key,
                    self.client.address(),
                    e
                ),
            }
        }
    }

    /// Push `key` unless the remote already has it; true if a blob was sent
    async fn replicate(&self, key: &Key) -> Result<bool> {
        let blob = match self.dictionary.get(key, true).await {
            Some(blob) => blob,
            None => return Ok(false),
        };

        if self.client.have(key).await? {
            return Ok(false);
        }

        // Refused means another writer got there first.
        let mut upload = match self.client.put(key).await? {
            Some(upload) => upload,
            None => return Ok(false),
        };

        let mut reader = match blob.read().await {
            Ok(reader) => reader,
            Err(e) => {
                let _ = upload.discard().await;
                return Err(e.into());
            }
        };

        upload.write_from(&mut reader).await?;
        upload.close().await
    }
}
