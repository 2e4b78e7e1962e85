use anyhow::{Context, Result};
use avalanche_network::{LocalDiscovery, MulticastDiscovery, Server, ServiceDiscovery};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::Config;

/// Daemon orchestrator: owns the cache server and drives its update loop
pub struct Node {
    config: Config,
    server: Server,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl Node {
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing Avalanche node...");

        let discovery: Arc<dyn ServiceDiscovery> = if config.discovery.enabled {
            let multicast = MulticastDiscovery::start(config.multicast_config())
                .await
                .context("Failed to start multicast discovery")?;
            Arc::new(multicast)
        } else {
            info!("✓ Discovery disabled; running standalone");
            Arc::new(LocalDiscovery::new())
        };

        let server = Server::create(config.server_config()?, discovery)
            .await
            .context("Failed to start cache server")?;
        info!("✓ Cache server initialized");

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        Ok(Node {
            config,
            server,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        let advertised = self.server.advertised();
        info!("═══════════════════════════════════════════════");
        info!("  Avalanche node is now running");
        info!("═══════════════════════════════════════════════");
        info!("  Listening: {}", self.server.local_addr());
        info!(
            "  Advertised: {}:{}",
            advertised.host().unwrap_or("?"),
            advertised.port().unwrap_or(0)
        );
        match &self.config.server.blobs_path {
            Some(path) => info!("  Blobs: {}", path.display()),
            None => info!("  Blobs: memory only"),
        }
        info!("═══════════════════════════════════════════════");

        let stats_interval = Duration::from_secs(self.config.stats_interval_secs);
        let mut last_stats = Instant::now();

        let ctrl_c = signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("Received Ctrl+C signal");
                    break;
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
                _ = self.server.update() => {}
            }

            if !stats_interval.is_zero() && last_stats.elapsed() >= stats_interval {
                self.log_stats().await;
                last_stats = Instant::now();
            }
        }

        info!("Shutting down Avalanche node...");
        self.server.shutdown().await;
        info!("Shutdown complete");

        Ok(())
    }

    async fn log_stats(&self) {
        let stats = self.server.dictionary().stats().await;
        info!(
            blobs = stats.blob_count,
            bytes = stats.memory_usage,
            connections = self.server.connection_count(),
            peers = self.server.peer_count(),
            "Cache status"
        );
    }

    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avalanche_network::Client;
    use tempfile::TempDir;

    fn standalone_config(dir: &TempDir) -> Config {
        let mut config = Config::create_default(Some(dir.path().join("config.yaml"))).unwrap();
        config.server.bind = "127.0.0.1".to_string();
        config.server.port = 0;
        config.discovery.enabled = false;
        config.stats_interval_secs = 0;
        config
    }

    #[tokio::test]
    async fn test_node_serves_until_shutdown() {
        let dir = TempDir::new().unwrap();
        let node = Node::new(standalone_config(&dir)).await.unwrap();
        let address = node.server.local_addr();
        let shutdown = node.shutdown_handle();

        let task = tokio::spawn(node.run());

        let client = Client::new(address);
        assert!(client.ping().await);
        client.disconnect();

        shutdown.send(()).await.unwrap();
        task.await.unwrap().unwrap();
        assert!(!client.ping().await);
    }

    #[tokio::test]
    async fn test_node_rejects_bad_bind() {
        let dir = TempDir::new().unwrap();
        let mut config = standalone_config(&dir);
        config.server.bind = "nowhere".to_string();

        assert!(Node::new(config).await.is_err());
    }
}
