//! Service discovery boundary
//!
//! Servers advertise themselves as a `NetworkService` of type
//! `SERVICE_TYPE` whose property bag carries `Host` and `Port`; other
//! servers look those records up to build their peer set.

mod local;
mod multicast;

pub use local::LocalDiscovery;
pub use multicast::{MulticastConfig, MulticastDiscovery};

use async_trait::async_trait;
use avalanche_protocol::SERVICE_TYPE;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

use crate::error::Result;

/// Property holding the advertised host
pub const PROPERTY_HOST: &str = "Host";

/// Property holding the advertised TCP port
pub const PROPERTY_PORT: &str = "Port";

/// One advertised service record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkService {
    /// Service type tag
    pub service_type: String,

    /// Opaque key/value property bag
    pub properties: BTreeMap<String, String>,
}

impl NetworkService {
    /// Create a record with an empty property bag
    pub fn new(service_type: impl Into<String>) -> Self {
        NetworkService {
            service_type: service_type.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Record advertising an Avalanche server at `host:port`
    pub fn avalanche(host: &str, port: u16) -> Self {
        Self::new(SERVICE_TYPE)
            .with_property(PROPERTY_HOST, host)
            .with_property(PROPERTY_PORT, port.to_string())
    }

    /// Builder-style property setter
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    pub fn host(&self) -> Option<&str> {
        self.property(PROPERTY_HOST)
    }

    pub fn port(&self) -> Option<u16> {
        self.property(PROPERTY_PORT)?.parse().ok()
    }

    /// Socket address built from `Host` and `Port`
    ///
    /// Only literal IP hosts resolve; name lookup is left to the caller.
    pub fn address(&self) -> Option<SocketAddr> {
        let ip: IpAddr = self.host()?.parse().ok()?;
        Some(SocketAddr::new(ip, self.port()?))
    }
}

/// Publishes and finds service advertisements
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Start advertising `service`
    async fn publish(&self, service: NetworkService) -> Result<()>;

    /// Stop advertising `service`
    async fn withdraw(&self, service: &NetworkService) -> Result<()>;

    /// Every currently advertised service of `service_type`
    async fn find(&self, service_type: &str) -> Result<Vec<NetworkService>>;
}
