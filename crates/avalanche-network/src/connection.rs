//! Server-side session
//!
//! A `Connection` owns one accepted socket and serves its requests strictly
//! in order on a dedicated task. Logical failures are answered with
//! `Failure` and the session carries on; transport errors, timeouts in the
//! middle of a frame and protocol violations end it.

use avalanche_dictionary::{Blob, BlobWriter, Dictionary, DictionaryError};
use avalanche_protocol::wire;
use avalanche_protocol::{Command, Key, ProtocolError, PutSubCommand, Reply};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{NetworkError, Result};

/// Buffer size used when streaming blobs and chunks
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Session timeouts
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// A client silent for this long between commands is dropped
    pub idle_timeout: Duration,

    /// Time allowed for each read or write inside a frame
    pub read_timeout: Duration,

    /// How long one `process` iteration waits for a command byte
    pub poll_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            idle_timeout: Duration::from_secs(300),
            read_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Default)]
struct ConnectionState {
    stop: Notify,
    stopping: AtomicBool,
    finished: AtomicBool,
}

/// Handle to one running session
pub struct Connection {
    peer_addr: SocketAddr,
    state: Arc<ConnectionState>,
    task: Option<JoinHandle<()>>,
}

impl Connection {
    /// Start serving `stream` on `handle`
    pub fn spawn(
        handle: &Handle,
        stream: TcpStream,
        dictionary: Arc<Dictionary>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;

        let state = Arc::new(ConnectionState::default());
        let session = Session {
            stream: BufStream::new(stream),
            dictionary,
            config,
            peer_addr,
            last_activity: Instant::now(),
        };
        let task = handle.spawn(session.run(state.clone()));

        debug!("Connection from {} established", peer_addr);

        Ok(Connection {
            peer_addr,
            state,
            task: Some(task),
        })
    }

    /// Remote address of the client
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// True once the session has terminated
    pub fn is_finished(&self) -> bool {
        self.state.finished.load(Ordering::SeqCst)
    }

    /// Ask the session to stop after the current command and wait for it
    pub async fn stop(mut self) {
        self.state.stopping.store(true, Ordering::SeqCst);
        self.state.stop.notify_one();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Session {
    stream: BufStream<TcpStream>,
    dictionary: Arc<Dictionary>,
    config: ConnectionConfig,
    peer_addr: SocketAddr,
    last_activity: Instant,
}

impl Session {
    async fn run(mut self, state: Arc<ConnectionState>) {
        loop {
            match self.process(&state).await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(NetworkError::Protocol(e)) => {
                    warn!("Protocol error from {}: {}", self.peer_addr, e);
                    break;
                }
                Err(e) => {
                    debug!("Connection {} failed: {}", self.peer_addr, e);
                    break;
                }
            }
        }

        let _ = self.stream.shutdown().await;
        state.finished.store(true, Ordering::SeqCst);
        debug!("Connection from {} finished", self.peer_addr);
    }

    /// Serve at most one command; false once the session should end
    async fn process(&mut self, state: &ConnectionState) -> Result<bool> {
        if state.stopping.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let byte = tokio::select! {
            _ = state.stop.notified() => return Ok(false),
            read = timeout(self.config.poll_interval, self.stream.read_u8()) => match read {
                Err(_) => {
                    if self.last_activity.elapsed() >= self.config.idle_timeout {
                        info!("Connection from {} idle, closing", self.peer_addr);
                        return Ok(false);
                    }
                    return Ok(true);
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(byte)) => byte,
            },
        };

        let command = Command::from_u8(byte)?;
        match command {
            Command::Ping => self.reply(Reply::Ok).await?,
            Command::Stat => self.stat().await?,
            Command::Get => self.get().await?,
            Command::Put => self.put().await?,
            Command::Stats => self.stats().await?,
            Command::Keys => self.keys().await?,
            Command::Touch | Command::Evict => self.batch(command).await?,
        }

        timed(self.config.read_timeout, self.stream.flush()).await?;
        self.last_activity = Instant::now();
        Ok(true)
    }

    async fn stat(&mut self) -> Result<()> {
        let key = self.read_key().await?;
        match self.dictionary.get(&key, true).await {
            Some(blob) => {
                self.reply(Reply::Ok).await?;
                timed(self.config.read_timeout, self.stream.write_i64(blob.size() as i64)).await
            }
            None => self.reply(Reply::Failure).await,
        }
    }

    async fn get(&mut self) -> Result<()> {
        let key = self.read_key().await?;
        let blob = match self.dictionary.get(&key, false).await {
            Some(blob) => blob,
            None => return self.reply(Reply::Failure).await,
        };

        // The size is read after opening; it never exceeds what the reader yields.
        let reader = match blob.read().await {
            Ok(reader) => reader,
            Err(e) => {
                warn!("Unable to read {}: {}", key, e);
                return self.reply(Reply::Failure).await;
            }
        };
        let size = blob.size();

        self.reply(Reply::Ok).await?;
        timed(self.config.read_timeout, self.stream.write_i64(size as i64)).await?;

        // Once the size is on the wire nothing but exactly that many bytes
        // may follow.
        let mut reader = reader.take(size);
        let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
        let mut sent = 0u64;
        loop {
            let read = reader.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            timed(self.config.read_timeout, self.stream.write_all(&buf[..read])).await?;
            sent += read as u64;
        }

        if sent != size {
            return Err(NetworkError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("blob {} ended after {} of {} bytes", key, sent, size),
            )));
        }
        Ok(())
    }

    async fn put(&mut self) -> Result<()> {
        let key = self.read_key().await?;

        if self.dictionary.get(&key, true).await.is_some() {
            return self.reply(Reply::Failure).await;
        }

        let blob = match self.dictionary.create_blob().await {
            Ok(blob) => blob,
            Err(e) => {
                warn!("Unable to create blob for {}: {}", key, e);
                return self.reply(Reply::Failure).await;
            }
        };

        let result = match blob.append().await {
            Ok(writer) => {
                self.reply(Reply::Ok).await?;
                timed(self.config.read_timeout, self.stream.flush()).await?;
                self.receive_blob(key, &blob, writer).await
            }
            Err(e) => {
                warn!("Unable to open blob for {}: {}", key, e);
                self.reply(Reply::Failure).await
            }
        };

        self.dictionary.release_blob(blob).await;
        result
    }

    /// Run the put sub-protocol until commit or discard
    async fn receive_blob(
        &mut self,
        key: Key,
        blob: &Arc<dyn Blob>,
        mut writer: BlobWriter,
    ) -> Result<()> {
        let mut failed = false;

        loop {
            let byte = timeout(self.config.idle_timeout, self.stream.read_u8()).await??;
            match PutSubCommand::from_u8(byte)? {
                PutSubCommand::Append => {
                    let length = wire::check_chunk_length(self.read_i64().await?)?;
                    if !failed {
                        failed = !self.receive_chunk(length, &mut writer).await?;
                    } else {
                        self.skip_chunk(length).await?;
                    }
                    self.reply(Reply::from_success(!failed)).await?;
                }
                PutSubCommand::Commit => {
                    let committed = !failed && self.commit(key, blob, &mut writer).await;
                    return self.reply(Reply::from_success(committed)).await;
                }
                PutSubCommand::Discard => {
                    debug!("Put {} discarded by {}", key, self.peer_addr);
                    return self.reply(Reply::Ok).await;
                }
            }
            timed(self.config.read_timeout, self.stream.flush()).await?;
        }
    }

    /// Copy one chunk into the blob; false if the blob rejected the bytes,
    /// in which case the rest of the chunk is still consumed
    async fn receive_chunk(&mut self, length: usize, writer: &mut BlobWriter) -> Result<bool> {
        let mut buf = vec![0u8; length.min(STREAM_BUFFER_SIZE)];
        let mut remaining = length;
        while remaining > 0 {
            let want = remaining.min(buf.len());
            timed(self.config.read_timeout, self.stream.read_exact(&mut buf[..want])).await?;
            remaining -= want;

            if let Err(e) = writer.write_all(&buf[..want]).await {
                warn!("Append failed: {}", e);
                self.skip_chunk(remaining).await?;
                return Ok(false);
            }
        }

        if let Err(e) = writer.flush().await {
            warn!("Append failed: {}", e);
            return Ok(false);
        }
        Ok(true)
    }

    async fn skip_chunk(&mut self, length: usize) -> Result<()> {
        let mut buf = vec![0u8; length.min(STREAM_BUFFER_SIZE)];
        let mut remaining = length;
        while remaining > 0 {
            let want = remaining.min(buf.len());
            timed(self.config.read_timeout, self.stream.read_exact(&mut buf[..want])).await?;
            remaining -= want;
        }
        Ok(())
    }

    async fn commit(&self, key: Key, blob: &Arc<dyn Blob>, writer: &mut BlobWriter) -> bool {
        if let Err(e) = writer.shutdown().await {
            warn!("Unable to finish blob {}: {}", key, e);
            return false;
        }

        // Another session may have committed the same key meanwhile.
        match self.dictionary.put_new(key, blob.clone(), false).await {
            Ok(()) => {
                debug!("Put {} committed by {}", key, self.peer_addr);
                true
            }
            Err(DictionaryError::AlreadyExists) => {
                debug!("Put {} lost the race to another upload", key);
                false
            }
            Err(e) => {
                warn!("Unable to commit {}: {}", key, e);
                false
            }
        }
    }

    async fn stats(&mut self) -> Result<()> {
        let stats = self.dictionary.stats().await;
        self.reply(Reply::Ok).await?;
        timed(self.config.read_timeout, wire::write_stats(&mut self.stream, &stats)).await
    }

    async fn keys(&mut self) -> Result<()> {
        let keys = self.dictionary.snapshot_keys().await;
        self.reply(Reply::Ok).await?;
        timed(self.config.read_timeout, wire::write_keys(&mut self.stream, &keys)).await
    }

    /// Touch or evict a batch, answering `Continue` for every key but the
    /// last and stopping at the first failure
    async fn batch(&mut self, command: Command) -> Result<()> {
        let count = wire::check_key_count(self.read_i64().await?)?;
        let mut keys = Vec::with_capacity(count);
        for _ in 0..count {
            keys.push(self.read_key().await?);
        }

        for (index, key) in keys.iter().enumerate() {
            let success = match command {
                Command::Touch => self.touch(key).await,
                _ => self.evict(key).await,
            };

            if !success {
                return self.reply(Reply::Failure).await;
            }
            if index + 1 < keys.len() {
                self.reply(Reply::Continue).await?;
            }
        }

        self.reply(Reply::Ok).await
    }

    async fn touch(&self, key: &Key) -> bool {
        match self.dictionary.get(key, false).await {
            Some(blob) => match blob.touch().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Unable to touch {}: {}", key, e);
                    false
                }
            },
            None => false,
        }
    }

    async fn evict(&self, key: &Key) -> bool {
        match self.dictionary.remove(key).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Unable to evict {}: {}", key, e);
                false
            }
        }
    }

    async fn read_key(&mut self) -> Result<Key> {
        let key = timed(self.config.read_timeout, wire::read_key(&mut self.stream)).await?;
        if !key.is_valid() {
            return Err(ProtocolError::InvalidKey.into());
        }
        Ok(key)
    }

    async fn read_i64(&mut self) -> Result<i64> {
        timed(self.config.read_timeout, self.stream.read_i64()).await
    }

    async fn reply(&mut self, reply: Reply) -> Result<()> {
        timed(self.config.read_timeout, wire::write_reply(&mut self.stream, reply)).await
    }
}

/// Bound one read or write inside a frame
async fn timed<T, F>(limit: Duration, operation: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    Ok(timeout(limit, operation).await??)
}
