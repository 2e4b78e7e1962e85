#![allow(dead_code)]

use avalanche_dictionary::Dictionary;
use avalanche_network::{Client, LocalDiscovery, Server, ServerConfig};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Server driven by a background `update()` loop
pub struct TestServer {
    server: Arc<Mutex<Server>>,
    task: JoinHandle<()>,
    pub address: SocketAddr,
    pub dictionary: Arc<Dictionary>,
}

pub fn loopback_config() -> ServerConfig {
    ServerConfig {
        bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        accept_timeout: Duration::from_millis(10),
        ..Default::default()
    }
}

impl TestServer {
    pub async fn start(discovery: &LocalDiscovery) -> Self {
        Self::start_with(loopback_config(), discovery).await
    }

    pub async fn start_with(config: ServerConfig, discovery: &LocalDiscovery) -> Self {
        let server = Server::create(config, Arc::new(discovery.clone()))
            .await
            .unwrap();
        let address = server.local_addr();
        let dictionary = server.dictionary().clone();

        let server = Arc::new(Mutex::new(server));
        let driven = server.clone();
        let task = tokio::spawn(async move {
            loop {
                driven.lock().await.update().await;
                tokio::task::yield_now().await;
            }
        });

        TestServer {
            server,
            task,
            address,
            dictionary,
        }
    }

    pub fn client(&self) -> Client {
        Client::new(self.address)
    }

    pub async fn connection_count(&self) -> usize {
        self.server.lock().await.connection_count()
    }

    pub async fn peer_count(&self) -> usize {
        self.server.lock().await.peer_count()
    }

    /// Wait until exactly `expected` sessions are running
    pub async fn wait_for_connections(&self, expected: usize) -> bool {
        for _ in 0..200 {
            if self.connection_count().await == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    /// Wait until the server replicates to `expected` peers
    pub async fn wait_for_peers(&self, expected: usize) -> bool {
        for _ in 0..200 {
            if self.peer_count().await == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
