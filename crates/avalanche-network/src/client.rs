//! Pooled protocol client
//!
//! A `Client` keeps a small pool of idle sockets to one server. Every
//! operation pops a pooled socket (or dials a new one), runs one exchange
//! and hands the socket back only after a clean terminal reply, so a socket
//! in the pool is always positioned at a request boundary.

use avalanche_protocol::wire::{self, Stats};
use avalanche_protocol::{
    Command, Key, ProtocolError, PutSubCommand, Reply, MAX_BATCH_KEYS, MAX_CHUNK_SIZE,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream, Take};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{NetworkError, Result};

type Transport = BufStream<TcpStream>;

/// Read buffer used by `GetStream` copies and drains
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Time allowed to establish a TCP connection
    pub connect_timeout: Duration,

    /// Time allowed for any single request/reply exchange or chunk
    pub io_timeout: Duration,

    /// Idle sockets kept for reuse
    pub max_pooled: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(30),
            max_pooled: 4,
        }
    }
}

struct ClientInner {
    address: SocketAddr,
    config: ClientConfig,
    pool: Mutex<Vec<Transport>>,
}

/// Avalanche protocol client
///
/// Cloning is cheap and clones share one socket pool. Logical failures
/// (missing key, existing key) are reported as `Ok(false)` / `Ok(None)`;
/// `Err` means the exchange itself broke.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a client for the server at `address`
    pub fn new(address: SocketAddr) -> Self {
        Self::with_config(address, ClientConfig::default())
    }

    pub fn with_config(address: SocketAddr, config: ClientConfig) -> Self {
        Client {
            inner: Arc::new(ClientInner {
                address,
                config,
                pool: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Address of the server
    pub fn address(&self) -> SocketAddr {
        self.inner.address
    }

    /// Number of idle pooled sockets
    pub fn pooled_count(&self) -> usize {
        self.pool().len()
    }

    /// Close every idle pooled socket
    pub fn disconnect(&self) {
        let closed = std::mem::take(&mut *self.pool()).len();
        if closed > 0 {
            debug!("Closed {} pooled connections to {}", closed, self.inner.address);
        }
    }

    /// Check that the server answers
    pub async fn ping(&self) -> bool {
        match self.exchange(self.ping_exchange()).await {
            Ok(alive) => alive,
            Err(e) => {
                debug!("Ping {} failed: {}", self.inner.address, e);
                false
            }
        }
    }

    async fn ping_exchange(&self) -> Result<bool> {
        let mut stream = self.establish(Command::Ping).await?;
        let reply = read_reply(&mut stream).await?;
        self.release(stream);
        Ok(reply == Reply::Ok)
    }

    /// Size of the blob stored under `key`, if any
    ///
    /// Does not count as an access on the server, so it never triggers
    /// replication.
    pub async fn stat(&self, key: &Key) -> Result<Option<u64>> {
        check_key(key)?;
        self.exchange(self.stat_exchange(key)).await
    }

    async fn stat_exchange(&self, key: &Key) -> Result<Option<u64>> {
        let mut stream = self.request_with_key(Command::Stat, key).await?;

        match read_reply(&mut stream).await? {
            Reply::Ok => {
                let size = wire::check_blob_size(stream.read_i64().await?)?;
                self.release(stream);
                Ok(Some(size))
            }
            Reply::Failure => {
                self.release(stream);
                Ok(None)
            }
            other => Err(NetworkError::UnexpectedReply(other.to_u8())),
        }
    }

    /// Check whether the server holds `key`
    pub async fn have(&self, key: &Key) -> Result<bool> {
        Ok(self.stat(key).await?.is_some())
    }

    /// Record an access to every key; false once any key is missing
    pub async fn touch(&self, keys: &[Key]) -> Result<bool> {
        self.batch(Command::Touch, keys).await
    }

    /// Remove every key; false once any key could not be removed
    pub async fn evict(&self, keys: &[Key]) -> Result<bool> {
        self.batch(Command::Evict, keys).await
    }

    async fn batch(&self, command: Command, keys: &[Key]) -> Result<bool> {
        for key in keys {
            check_key(key)?;
        }

        if keys.is_empty() {
            return self.exchange(self.batch_exchange(command, keys)).await;
        }

        for chunk in keys.chunks(MAX_BATCH_KEYS as usize) {
            if !self.exchange(self.batch_exchange(command, chunk)).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn batch_exchange(&self, command: Command, keys: &[Key]) -> Result<bool> {
        let mut stream = self.establish(command).await?;
        wire::write_keys(&mut stream, keys).await?;
        stream.flush().await?;

        loop {
            match read_reply(&mut stream).await? {
                Reply::Continue => continue,
                reply => {
                    self.release(stream);
                    return Ok(reply == Reply::Ok);
                }
            }
        }
    }

    /// Aggregate counters of the server's dictionary
    pub async fn stats(&self) -> Result<Stats> {
        self.exchange(self.stats_exchange()).await
    }

    async fn stats_exchange(&self) -> Result<Stats> {
        let mut stream = self.establish(Command::Stats).await?;
        self.expect_ok(&mut stream).await?;

        let stats = wire::read_stats(&mut stream).await?;
        self.release(stream);
        Ok(stats)
    }

    /// Every key held by the server
    pub async fn keys(&self) -> Result<Vec<Key>> {
        self.exchange(self.keys_exchange()).await
    }

    async fn keys_exchange(&self) -> Result<Vec<Key>> {
        let mut stream = self.establish(Command::Keys).await?;
        self.expect_ok(&mut stream).await?;

        let count = stream.read_i64().await?;
        let count = usize::try_from(count).map_err(|_| ProtocolError::InvalidLength(count))?;

        let mut keys = Vec::with_capacity(count.min(MAX_BATCH_KEYS as usize));
        for _ in 0..count {
            keys.push(wire::read_key(&mut stream).await?);
        }

        self.release(stream);
        Ok(keys)
    }

    /// Open a read stream over the blob stored under `key`
    pub async fn get(&self, key: &Key) -> Result<Option<GetStream>> {
        check_key(key)?;
        self.exchange(self.get_exchange(key)).await
    }

    async fn get_exchange(&self, key: &Key) -> Result<Option<GetStream>> {
        let mut stream = self.request_with_key(Command::Get, key).await?;

        match read_reply(&mut stream).await? {
            Reply::Ok => {
                let size = wire::check_blob_size(stream.read_i64().await?)?;
                Ok(Some(GetStream::new(self.clone(), stream, size)))
            }
            Reply::Failure => {
                self.release(stream);
                Ok(None)
            }
            other => Err(NetworkError::UnexpectedReply(other.to_u8())),
        }
    }

    /// Start uploading a blob under `key`
    ///
    /// Returns `None` when the server refuses, typically because the key is
    /// already stored.
    pub async fn put(&self, key: &Key) -> Result<Option<PutStream>> {
        check_key(key)?;
        self.exchange(self.put_exchange(key)).await
    }

    async fn put_exchange(&self, key: &Key) -> Result<Option<PutStream>> {
        let mut stream = self.request_with_key(Command::Put, key).await?;

        match read_reply(&mut stream).await? {
            Reply::Ok => Ok(Some(PutStream::new(self.clone(), stream))),
            Reply::Failure => {
                self.release(stream);
                Ok(None)
            }
            other => Err(NetworkError::UnexpectedReply(other.to_u8())),
        }
    }

    async fn request_with_key(&self, command: Command, key: &Key) -> Result<Transport> {
        let mut stream = self.establish(command).await?;
        wire::write_key(&mut stream, key).await?;
        stream.flush().await?;
        Ok(stream)
    }

    /// Flush the request and read a reply that must be `Ok`
    async fn expect_ok(&self, stream: &mut Transport) -> Result<()> {
        stream.flush().await?;
        match read_reply(stream).await? {
            Reply::Ok => Ok(()),
            Reply::Failure => Err(NetworkError::Rejected),
            other => Err(NetworkError::UnexpectedReply(other.to_u8())),
        }
    }

    /// Pop a live socket and send `command`, dialling a new connection when
    /// no pooled socket survives
    async fn establish(&self, command: Command) -> Result<Transport> {
        while let Some(mut stream) = self.take_pooled() {
            if !is_alive(&stream) {
                debug!("Dropping stale connection to {}", self.inner.address);
                continue;
            }
            match send_command(&mut stream, command).await {
                Ok(()) => return Ok(stream),
                Err(e) => debug!(
                    "Pooled connection to {} failed ({}), reconnecting",
                    self.inner.address, e
                ),
            }
        }

        let mut stream = self.connect().await?;
        send_command(&mut stream, command).await?;
        Ok(stream)
    }

    async fn connect(&self) -> Result<Transport> {
        let address = self.inner.address;
        let stream = timeout(self.inner.config.connect_timeout, TcpStream::connect(address))
            .await?
            .map_err(|e| {
                NetworkError::ConnectionFailed(format!("Unable to connect to {}: {}", address, e))
            })?;
        stream.set_nodelay(true)?;
        debug!("Connected to {}", address);
        Ok(BufStream::new(stream))
    }

    fn take_pooled(&self) -> Option<Transport> {
        self.pool().pop()
    }

    /// Return a socket sitting at a request boundary to the pool
    fn release(&self, stream: Transport) {
        let mut pool = self.pool();
        if pool.len() < self.inner.config.max_pooled {
            pool.push(stream);
        }
    }

    fn pool(&self) -> std::sync::MutexGuard<'_, Vec<Transport>> {
        self.inner.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn exchange<T, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        timeout(self.inner.config.io_timeout, operation).await?
    }

    fn io_timeout(&self) -> Duration {
        self.inner.config.io_timeout
    }
}

fn check_key(key: &Key) -> Result<()> {
    if !key.is_valid() {
        return Err(ProtocolError::InvalidKey.into());
    }
    Ok(())
}

/// A pooled socket is reusable only if the server has neither closed it nor
/// sent anything unsolicited.
fn is_alive(stream: &Transport) -> bool {
    let mut probe = [0u8; 1];
    match stream.get_ref().try_read(&mut probe) {
        Ok(_) => false,
        Err(e) => e.kind() == std::io::ErrorKind::WouldBlock,
    }
}

async fn send_command(stream: &mut Transport, command: Command) -> Result<()> {
    wire::write_command(stream, command).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_reply<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Reply> {
    Ok(Reply::from_u8(reader.read_u8().await?)?)
}

/// Read side of a successful `get`
///
/// The stream knows exactly how many bytes remain. Once fully consumed, or
/// after `close` drains the remainder, the socket goes back to the pool;
/// dropping a partially read stream closes the socket instead.
pub struct GetStream {
    client: Client,
    stream: Option<Take<Transport>>,
    size: u64,
}

impl GetStream {
    fn new(client: Client, stream: Transport, size: u64) -> Self {
        let mut get = GetStream {
            client,
            stream: Some(stream.take(size)),
            size,
        };
        get.finish_if_done();
        get
    }

    /// Total size of the blob
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes not yet read
    pub fn available(&self) -> u64 {
        self.stream.as_ref().map(Take::limit).unwrap_or(0)
    }

    /// Read the next bytes of the blob; `Ok(0)` at the end
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let io_timeout = self.client.io_timeout();
        let stream = match self.stream.as_mut() {
            Some(stream) if stream.limit() > 0 => stream,
            _ => return Ok(0),
        };
        if buf.is_empty() {
            return Ok(0);
        }

        let read = match timeout(io_timeout, stream.read(buf)).await {
            Ok(Ok(read)) => read,
            Ok(Err(e)) => {
                self.stream = None;
                return Err(e.into());
            }
            Err(e) => {
                self.stream = None;
                return Err(e.into());
            }
        };

        if read == 0 {
            self.stream = None;
            return Err(NetworkError::StreamClosed);
        }

        self.finish_if_done();
        Ok(read)
    }

    /// Copy the rest of the blob into `writer`
    pub async fn copy_to<W>(&mut self, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let read = self.read(&mut buf).await?;
            if read == 0 {
                break;
            }
            writer.write_all(&buf[..read]).await?;
            total += read as u64;
        }
        writer.flush().await?;
        Ok(total)
    }

    /// Read the rest of the blob into memory
    pub async fn read_to_end(mut self) -> Result<Vec<u8>> {
        let capacity = usize::try_from(self.available()).unwrap_or(usize::MAX);
        let mut data = Vec::with_capacity(capacity.min(MAX_CHUNK_SIZE as usize));
        self.copy_to(&mut data).await?;
        Ok(data)
    }

    /// Discard whatever has not been read so the socket can be reused
    pub async fn close(mut self) -> Result<()> {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        while self.read(&mut buf).await? > 0 {}
        Ok(())
    }

    fn finish_if_done(&mut self) {
        if self.available() == 0 {
            if let Some(stream) = self.stream.take() {
                self.client.release(stream.into_inner());
            }
        }
    }
}

/// Write side of a successful `put`
///
/// Each chunk is acknowledged before the next is sent. `close` commits the
/// blob; dropping the stream without `close` or `discard` closes the socket
/// and the server abandons the upload.
pub struct PutStream {
    client: Client,
    stream: Option<Transport>,
    written: u64,
    rejected: bool,
}

impl PutStream {
    fn new(client: Client, stream: Transport) -> Self {
        PutStream {
            client,
            stream: Some(stream),
            written: 0,
            rejected: false,
        }
    }

    /// Bytes acknowledged so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Send `data`, split into chunks of at most `MAX_CHUNK_SIZE`
    ///
    /// Fails with `Rejected` if the server could not store a chunk; the
    /// upload can then only be discarded.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(MAX_CHUNK_SIZE as usize) {
            self.append(chunk).await?;
        }
        Ok(())
    }

    /// Stream everything `reader` yields, returning the byte count
    pub async fn write_from<R>(&mut self, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = vec![0u8; MAX_CHUNK_SIZE as usize];
        let mut total = 0u64;
        loop {
            let filled = fill(reader, &mut buf).await?;
            if filled == 0 {
                break;
            }
            self.append(&buf[..filled]).await?;
            total += filled as u64;
            if filled < buf.len() {
                break;
            }
        }
        Ok(total)
    }

    async fn append(&mut self, chunk: &[u8]) -> Result<()> {
        if self.rejected {
            return Err(NetworkError::Rejected);
        }
        let io_timeout = self.client.io_timeout();
        let stream = self.stream.as_mut().ok_or(NetworkError::StreamClosed)?;

        let result = timeout(io_timeout, send_chunk(stream, chunk)).await;

        match result {
            Ok(Ok(Reply::Ok)) => {
                self.written += chunk.len() as u64;
                Ok(())
            }
            Ok(Ok(Reply::Failure)) => {
                self.rejected = true;
                Err(NetworkError::Rejected)
            }
            Ok(Ok(other)) => {
                self.stream = None;
                Err(NetworkError::UnexpectedReply(other.to_u8()))
            }
            Ok(Err(e)) => {
                self.stream = None;
                Err(e)
            }
            Err(e) => {
                self.stream = None;
                Err(e.into())
            }
        }
    }

    /// Commit the upload; `Ok(false)` if the server did not index it
    pub async fn close(mut self) -> Result<bool> {
        if self.rejected {
            self.finish(PutSubCommand::Discard).await?;
            return Ok(false);
        }
        Ok(self.finish(PutSubCommand::Commit).await? == Reply::Ok)
    }

    /// Abandon the upload
    pub async fn discard(mut self) -> Result<()> {
        match self.finish(PutSubCommand::Discard).await? {
            Reply::Ok => Ok(()),
            other => Err(NetworkError::UnexpectedReply(other.to_u8())),
        }
    }

    async fn finish(&mut self, sub: PutSubCommand) -> Result<Reply> {
        let mut stream = self.stream.take().ok_or(NetworkError::StreamClosed)?;

        let reply = timeout(self.client.io_timeout(), send_sub_command(&mut stream, sub)).await??;

        match reply {
            Reply::Ok | Reply::Failure => {
                self.client.release(stream);
                Ok(reply)
            }
            other => Err(NetworkError::UnexpectedReply(other.to_u8())),
        }
    }
}

async fn send_chunk(stream: &mut Transport, chunk: &[u8]) -> Result<Reply> {
    wire::write_sub_command(stream, PutSubCommand::Append).await?;
    stream.write_i64(chunk.len() as i64).await?;
    stream.write_all(chunk).await?;
    stream.flush().await?;
    read_reply(stream).await
}

async fn send_sub_command(stream: &mut Transport, sub: PutSubCommand) -> Result<Reply> {
    wire::write_sub_command(stream, sub).await?;
    stream.flush().await?;
    read_reply(stream).await
}

/// Read until `buf` is full or the reader is exhausted
async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let read = reader.read(&mut buf[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}
