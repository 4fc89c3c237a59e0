//! The public face of the tunnel registry

use crate::error::Result;
use crate::feed::ServiceFeed;
use crate::lease::LeaseManager;
use crate::model::{Event, Service};
use crate::reaper::Reaper;
use futures::stream::BoxStream;
use registry_api::EndpointStatus;
use registry_store::Store;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// TunnelRegistry bundles the lease manager, the sweep loop, and the
/// service feed over one shared store connection.
pub struct TunnelRegistry {
    leases: LeaseManager,
    reaper: Reaper,
    feed: ServiceFeed,
}

impl TunnelRegistry {
    pub fn new(store: Arc<dyn Store>, sweep_interval: Duration) -> Self {
        Self {
            leases: LeaseManager::new(store.clone()),
            reaper: Reaper::new(store.clone(), sweep_interval),
            feed: ServiceFeed::new(store),
        }
    }

    /// Advisory check that no current endpoint holds the (host, port) pair
    pub async fn check_available(&self, host: &str, port: u16) -> Result<bool> {
        self.leases.check_available(host, port).await
    }

    /// Register a tunnel under a subdomain and return its id
    pub async fn issue(
        &self,
        subdomain: &str,
        host: &str,
        port: u16,
        ttl: u32,
        reap_after: u32,
        config: BTreeMap<String, serde_json::Value>,
    ) -> Result<String> {
        self.leases
            .issue(subdomain, host, port, ttl, reap_after, config)
            .await
    }

    /// Record a heartbeat for a tunnel
    pub async fn renew(&self, subdomain: &str, id: &str, status: EndpointStatus) -> Result<()> {
        self.leases.renew(subdomain, id, status).await
    }

    /// Deregister a tunnel
    pub async fn retire(&self, subdomain: &str, id: &str) -> Result<()> {
        self.leases.retire(subdomain, id).await
    }

    /// Current services plus the stream of subsequent changes
    pub async fn watch(&self) -> Result<(Vec<Service>, BoxStream<'static, Event>)> {
        self.feed.watch().await
    }

    /// Drive the sweep loop; returns only on cancellation
    pub async fn run(&self) -> Result<()> {
        self.reaper.run().await
    }
}
