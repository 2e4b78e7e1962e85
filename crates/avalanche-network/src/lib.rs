//! Avalanche Network Module
//!
//! TCP transport of the Avalanche cache:
//! - `Client`: pooled protocol client with streamed gets and puts
//! - `Connection`: server-side session task serving one client
//! - `Server`: accept loop, connection bookkeeping and peer management
//! - `Peer`: background replicator pushing local puts to one remote server
//! - `discovery`: the service advertisement boundary used to find peers

pub mod client;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod peer;
pub mod server;

pub use client::{Client, ClientConfig, GetStream, PutStream};
pub use connection::{Connection, ConnectionConfig};
pub use discovery::{
    LocalDiscovery, MulticastConfig, MulticastDiscovery, NetworkService, ServiceDiscovery,
};
pub use error::{NetworkError, Result};
pub use peer::Peer;
pub use server::{Server, ServerConfig};
