//! UDP multicast service discovery
//!
//! Every published record is announced to a multicast group on a fixed
//! interval; records that have not been re-announced within the expiry
//! window are forgotten. A withdrawn record is announced once as gone.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{NetworkService, ServiceDiscovery};
use crate::error::{NetworkError, Result};

/// Multicast group for service announcements (IPv4)
pub const MULTICAST_ADDR: &str = "239.255.40.1";

/// UDP port of the announcement group
pub const MULTICAST_PORT: u16 = 40002;

/// Largest announcement datagram accepted
const MAX_DATAGRAM: usize = 8192;

/// Tag leading every announcement datagram
const MAGIC: u32 = 0x4156_4c43;

/// Multicast discovery configuration
#[derive(Debug, Clone)]
pub struct MulticastConfig {
    /// Multicast group address
    pub multicast_addr: String,

    /// Multicast port
    pub multicast_port: u16,

    /// Interval between re-announcements of published records
    pub announce_interval: Duration,

    /// Age after which an unrefreshed record is dropped
    pub expiry: Duration,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        MulticastConfig {
            multicast_addr: MULTICAST_ADDR.to_string(),
            multicast_port: MULTICAST_PORT,
            announce_interval: Duration::from_secs(5),
            expiry: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum DiscoveryMessage {
    Announce(NetworkService),
    Withdraw(NetworkService),
}

#[derive(Debug, Serialize, Deserialize)]
struct Datagram {
    magic: u32,
    message: DiscoveryMessage,
}

fn encode(message: DiscoveryMessage) -> Result<Vec<u8>> {
    Ok(bincode::serialize(&Datagram {
        magic: MAGIC,
        message,
    })?)
}

fn decode(data: &[u8]) -> Option<DiscoveryMessage> {
    let datagram: Datagram = bincode::deserialize(data).ok()?;
    (datagram.magic == MAGIC).then_some(datagram.message)
}

/// Last time each record was heard
#[derive(Debug, Default)]
struct Registry {
    seen: HashMap<NetworkService, Instant>,
}

impl Registry {
    fn observe(&mut self, message: DiscoveryMessage, now: Instant) {
        match message {
            DiscoveryMessage::Announce(service) => {
                self.seen.insert(service, now);
            }
            DiscoveryMessage::Withdraw(service) => {
                self.seen.remove(&service);
            }
        }
    }

    fn live(&mut self, service_type: &str, now: Instant, expiry: Duration) -> Vec<NetworkService> {
        self.seen
            .retain(|_, heard| now.saturating_duration_since(*heard) < expiry);
        self.seen
            .keys()
            .filter(|service| service.service_type == service_type)
            .cloned()
            .collect()
    }
}

struct Shared {
    config: MulticastConfig,
    group: SocketAddr,
    socket: UdpSocket,
    published: Mutex<Vec<NetworkService>>,
    registry: Mutex<Registry>,
}

impl Shared {
    async fn send(&self, message: DiscoveryMessage) -> Result<()> {
        let data = encode(message)?;
        self.socket
            .send_to(&data, self.group)
            .await
            .map_err(|e| NetworkError::DiscoveryFailed(format!("Multicast send failed: {}", e)))?;
        Ok(())
    }

    fn observe(&self, message: DiscoveryMessage) {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .observe(message, Instant::now());
    }

    fn published(&self) -> Vec<NetworkService> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Discovery over a LAN multicast group
pub struct MulticastDiscovery {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl MulticastDiscovery {
    /// Join the multicast group and start the receive and announce tasks
    pub async fn start(config: MulticastConfig) -> Result<Self> {
        let group_ip: Ipv4Addr = config.multicast_addr.parse().map_err(|e| {
            NetworkError::InvalidAddress(format!("Invalid multicast address: {}", e))
        })?;

        let socket = bind_multicast(group_ip, config.multicast_port).map_err(|e| {
            NetworkError::DiscoveryFailed(format!(
                "Failed to join multicast group {}:{}: {}",
                group_ip, config.multicast_port, e
            ))
        })?;
        let socket = UdpSocket::from_std(socket)?;

        info!(
            "✓ Multicast discovery on {}:{}",
            group_ip, config.multicast_port
        );

        let shared = Arc::new(Shared {
            group: SocketAddr::from((group_ip, config.multicast_port)),
            config,
            socket,
            published: Mutex::new(Vec::new()),
            registry: Mutex::new(Registry::default()),
        });

        let tasks = vec![
            tokio::spawn(receive_loop(shared.clone())),
            tokio::spawn(announce_loop(shared.clone())),
        ];

        Ok(MulticastDiscovery { shared, tasks })
    }
}

impl Drop for MulticastDiscovery {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn bind_multicast(group: Ipv4Addr, port: u16) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    // Several servers on one host share the group port.
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

async fn receive_loop(shared: Arc<Shared>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match shared.socket.recv_from(&mut buf).await {
            Ok((len, from)) => match decode(&buf[..len]) {
                Some(message) => shared.observe(message),
                None => debug!("Ignoring {} byte datagram from {}", len, from),
            },
            Err(e) => {
                warn!("Multicast receive failed: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn announce_loop(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.config.announce_interval);
    loop {
        ticker.tick().await;
        for service in shared.published() {
            if let Err(e) = shared.send(DiscoveryMessage::Announce(service)).await {
                debug!("Announcement failed: {}", e);
            }
        }
    }
}

#[async_trait]
impl ServiceDiscovery for MulticastDiscovery {
    async fn publish(&self, service: NetworkService) -> Result<()> {
        {
            let mut published = self
                .shared
                .published
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !published.contains(&service) {
                published.push(service.clone());
            }
        }

        self.shared
            .observe(DiscoveryMessage::Announce(service.clone()));
        self.shared.send(DiscoveryMessage::Announce(service)).await
    }

    async fn withdraw(&self, service: &NetworkService) -> Result<()> {
        self.shared
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|existing| existing != service);

        self.shared
            .observe(DiscoveryMessage::Withdraw(service.clone()));
        self.shared
            .send(DiscoveryMessage::Withdraw(service.clone()))
            .await
    }

    async fn find(&self, service_type: &str) -> Result<Vec<NetworkService>> {
        Ok(self
            .shared
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .live(service_type, Instant::now(), self.shared.config.expiry))
    }
}
