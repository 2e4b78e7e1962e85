use anyhow::{Context, Result};
use avalanche_network::{ConnectionConfig, MulticastConfig, ServerConfig};
use avalanche_protocol::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Seconds between stats log lines (0 disables)
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,

    #[serde(skip)]
    config_file_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory for persisted blobs; memory-only when absent
    #[serde(default)]
    pub blobs_path: Option<PathBuf>,
    #[serde(default)]
    pub advertise_host: Option<String>,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySection {
    pub enabled: bool,
    pub multicast_addr: String,
    pub multicast_port: u16,
    pub announce_interval_secs: u64,
    pub expiry_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_read_timeout() -> u64 {
    30
}

fn default_stats_interval() -> u64 {
    60
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            blobs_path: None,
            advertise_host: None,
            idle_timeout_secs: default_idle_timeout(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

impl Default for DiscoverySection {
    fn default() -> Self {
        let multicast = MulticastConfig::default();
        Self {
            enabled: true,
            multicast_addr: multicast.multicast_addr,
            multicast_port: multicast.multicast_port,
            announce_interval_secs: multicast.announce_interval.as_secs(),
            expiry_secs: multicast.expiry.as_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(Self::default_config_path);

        if !config_path.exists() {
            anyhow::bail!(
                "Configuration file not found: {}\nRun with --init to create a new configuration",
                config_path.display()
            );
        }

        let contents =
            fs::read_to_string(&config_path).context("Failed to read configuration file")?;

        let mut config: Config =
            serde_yaml::from_str(&contents).context("Failed to parse configuration file")?;
        config.config_file_path = config_path;

        Ok(config)
    }

    /// Write a default configuration and return it
    pub fn create_default(config_path: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(Self::default_config_path);

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let config = Config {
            server: ServerSection::default(),
            discovery: DiscoverySection::default(),
            logging: LoggingConfig::default(),
            stats_interval_secs: default_stats_interval(),
            config_file_path: config_path.clone(),
        };

        let yaml = serde_yaml::to_string(&config)?;
        fs::write(&config_path, yaml)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        Ok(config)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_file_path
    }

    fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("avalanched")
            .join("config.yaml")
    }

    /// Library settings for the cache server
    pub fn server_config(&self) -> Result<ServerConfig> {
        let bind_addr: IpAddr = self
            .server
            .bind
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.server.bind))?;

        Ok(ServerConfig {
            bind_addr,
            port: self.server.port,
            blobs_path: self.server.blobs_path.clone(),
            advertise_host: self.server.advertise_host.clone(),
            connection: ConnectionConfig {
                idle_timeout: Duration::from_secs(self.server.idle_timeout_secs),
                read_timeout: Duration::from_secs(self.server.read_timeout_secs),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    pub fn multicast_config(&self) -> MulticastConfig {
        MulticastConfig {
            multicast_addr: self.discovery.multicast_addr.clone(),
            multicast_port: self.discovery.multicast_port,
            announce_interval: Duration::from_secs(self.discovery.announce_interval_secs),
            expiry: Duration::from_secs(self.discovery.expiry_secs),
        }
    }
}
