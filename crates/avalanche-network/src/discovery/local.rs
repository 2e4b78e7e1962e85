//! In-process discovery registry

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};

use super::{NetworkService, ServiceDiscovery};
use crate::error::Result;

/// Registry shared by every clone
///
/// Servers created with clones of one `LocalDiscovery` see each other's
/// advertisements immediately, which is all a single-host cluster or a test
/// needs.
#[derive(Debug, Clone, Default)]
pub struct LocalDiscovery {
    services: Arc<Mutex<Vec<NetworkService>>>,
}

impl LocalDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of published records across all types
    pub fn len(&self) -> usize {
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ServiceDiscovery for LocalDiscovery {
    async fn publish(&self, service: NetworkService) -> Result<()> {
        let mut services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        if !services.contains(&service) {
            services.push(service);
        }
        Ok(())
    }

    async fn withdraw(&self, service: &NetworkService) -> Result<()> {
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|existing| existing != service);
        Ok(())
    }

    async fn find(&self, service_type: &str) -> Result<Vec<NetworkService>> {
        Ok(self
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|service| service.service_type == service_type)
            .cloned()
            .collect())
    }
}
