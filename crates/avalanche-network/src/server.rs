//! Cache server
//!
//! The host process calls `update()` in a loop. Each call accepts at most one
//! client, prunes finished connections and reconciles the peer set with the
//! servers currently advertised through discovery.

use avalanche_dictionary::Dictionary;
use avalanche_protocol::{DEFAULT_PORT, SERVICE_TYPE};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::runtime::Handle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::client::{Client, ClientConfig};
use crate::connection::{Connection, ConnectionConfig};
use crate::discovery::{NetworkService, ServiceDiscovery};
use crate::error::{NetworkError, Result};
use crate::peer::Peer;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Local address to bind
    pub bind_addr: IpAddr,

    /// TCP port (0 for OS-assigned)
    pub port: u16,

    /// Directory for persisted blobs; memory-only when unset
    pub blobs_path: Option<PathBuf>,

    /// Host advertised to other servers; detected when unset
    pub advertise_host: Option<String>,

    /// How long one `update` waits for a new client
    pub accept_timeout: Duration,

    /// Timeouts of each client session
    pub connection: ConnectionConfig,

    /// Client settings used by peers
    pub peer_client: ClientConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            blobs_path: None,
            advertise_host: None,
            accept_timeout: Duration::from_millis(100),
            connection: ConnectionConfig::default(),
            peer_client: ClientConfig::default(),
        }
    }
}

/// Avalanche cache server
pub struct Server {
    config: ServerConfig,
    handle: Handle,
    listener: TcpListener,
    local_addr: SocketAddr,
    advertised: NetworkService,
    advertised_addr: Option<SocketAddr>,
    dictionary: Arc<Dictionary>,
    discovery: Arc<dyn ServiceDiscovery>,
    connections: Vec<Connection>,
    peers: HashMap<SocketAddr, Peer>,
}

impl Server {
    /// Open the dictionary, bind the listener and publish the advertisement
    pub async fn create(config: ServerConfig, discovery: Arc<dyn ServiceDiscovery>) -> Result<Self> {
        let dictionary = Arc::new(Dictionary::create(config.blobs_path.clone()).await?);

        let bind = SocketAddr::new(config.bind_addr, config.port);
        let listener = TcpListener::bind(bind).await.map_err(|e| {
            NetworkError::ConnectionFailed(format!("Unable to bind {}: {}", bind, e))
        })?;
        let local_addr = listener.local_addr()?;

        let host = advertise_host(&config, local_addr).await;
        let advertised = NetworkService::avalanche(&host, local_addr.port());
        let advertised_addr = advertised.address();

        if let Err(e) = discovery.publish(advertised.clone()).await {
            warn!("Unable to publish {}:{}: {}", host, local_addr.port(), e);
        }

        info!(
            "✓ Avalanche server listening on {} (advertised as {}:{})",
            local_addr,
            host,
            local_addr.port()
        );

        Ok(Server {
            config,
            handle: Handle::current(),
            listener,
            local_addr,
            advertised,
            advertised_addr,
            dictionary,
            discovery,
            connections: Vec::new(),
            peers: HashMap::new(),
        })
    }

    /// Run one service iteration
    pub async fn update(&mut self) {
        match timeout(self.config.accept_timeout, self.listener.accept()).await {
            Ok(Ok((stream, addr))) => match Connection::spawn(
                &self.handle,
                stream,
                self.dictionary.clone(),
                self.config.connection.clone(),
            ) {
                Ok(connection) => self.connections.push(connection),
                Err(e) => warn!("Unable to serve {}: {}", addr, e),
            },
            Ok(Err(e)) => warn!("Accept failed: {}", e),
            Err(_) => {}
        }

        self.connections.retain(|connection| !connection.is_finished());

        self.update_peers().await;
    }

    async fn update_peers(&mut self) {
        let services = match self.discovery.find(SERVICE_TYPE).await {
            Ok(services) => services,
            Err(e) => {
                warn!("Peer discovery failed: {}", e);
                return;
            }
        };

        let advertised: HashSet<SocketAddr> = services
            .iter()
            .filter_map(NetworkService::address)
            .filter(|addr| !self.is_self(addr))
            .collect();

        let gone: Vec<SocketAddr> = self
            .peers
            .keys()
            .filter(|addr| !advertised.contains(addr))
            .copied()
            .collect();
        for addr in gone {
            if let Some(peer) = self.peers.remove(&addr) {
                debug!("Peer {} no longer advertised", addr);
                self.handle.spawn(peer.shutdown());
            }
        }

        for addr in advertised {
            if !self.peers.contains_key(&addr) {
                let client = Client::with_config(addr, self.config.peer_client.clone());
                let peer = Peer::spawn(&self.handle, self.dictionary.clone(), client);
                self.peers.insert(addr, peer);
            }
        }
    }

    fn is_self(&self, addr: &SocketAddr) -> bool {
        Some(*addr) == self.advertised_addr || *addr == self.local_addr
    }

    /// Sessions still running
    pub fn connection_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|connection| !connection.is_finished())
            .count()
    }

    /// Remote servers being replicated to
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_addresses(&self) -> Vec<SocketAddr> {
        self.peers.keys().copied().collect()
    }

    /// The server's local store
    pub fn dictionary(&self) -> &Arc<Dictionary> {
        &self.dictionary
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Record published to discovery
    pub fn advertised(&self) -> &NetworkService {
        &self.advertised
    }

    /// Withdraw the advertisement and stop every connection and peer
    pub async fn shutdown(mut self) {
        if let Err(e) = self.discovery.withdraw(&self.advertised).await {
            warn!("Unable to withdraw advertisement: {}", e);
        }

        for connection in self.connections.drain(..) {
            connection.stop().await;
        }
        for (_, peer) in self.peers.drain() {
            peer.shutdown().await;
        }

        info!("Avalanche server on {} stopped", self.local_addr);
    }
}

/// Pick the host other servers should dial
async fn advertise_host(config: &ServerConfig, local_addr: SocketAddr) -> String {
    if let Some(host) = &config.advertise_host {
        return host.clone();
    }
    if !local_addr.ip().is_unspecified() {
        return local_addr.ip().to_string();
    }
    match outbound_ip().await {
        Some(ip) => ip.to_string(),
        None => Ipv4Addr::LOCALHOST.to_string(),
    }
}

/// Address of the interface the OS routes external traffic through
///
/// Connecting a UDP socket sends nothing; it only selects a route.
async fn outbound_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).await.ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}
