//! Lease-scoped tunnel registration and heartbeats

use crate::error::{RegistryError, Result};
use chrono::{SecondsFormat, Utc};
use kube::ResourceExt;
use registry_api::v1alpha1::TunnelLeaseSpec;
use registry_api::{EndpointStatus, TunnelEndpoint};
use registry_store::{EntryOp, Store, StoreError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, warn};

/// Retries per write before a conflict surfaces to the caller
const CONFLICT_RETRIES: u32 = 3;
/// Delay between conflicting write attempts
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Current time as an RFC3339 string, the format leases carry on the wire
pub(crate) fn isotime() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// LeaseManager issues, renews, and retires the lease/record pair that
/// represents one tunnel.
pub struct LeaseManager {
    store: Arc<dyn Store>,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Whether no currently-present endpoint record, of any status, holds
    /// the exact (host, port) pair. A linear scan with no index, and not
    /// atomic with `issue`: two concurrent registrations can both pass.
    /// Advisory only.
    pub async fn check_available(&self, host: &str, port: u16) -> Result<bool> {
        for entry in self.store.list_entries().await? {
            for endpoint in entry.spec.endpoints.values() {
                if endpoint.address == host && endpoint.port == port {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Register a new tunnel under `subdomain`: create its lease, then
    /// insert its endpoint record. Returns the tunnel id.
    pub async fn issue(
        &self,
        subdomain: &str,
        host: &str,
        port: u16,
        ttl: u32,
        reap_after: u32,
        config: BTreeMap<String, serde_json::Value>,
    ) -> Result<String> {
        // The endpoints resource is provisioned before tunnels register;
        // its absence is a hard failure.
        match self.store.fetch_entry(subdomain).await {
            Ok(_) => {}
            Err(StoreError::NotFound(_)) => {
                return Err(RegistryError::EntryNotFound(subdomain.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        let lease = self
            .store
            .create_lease(TunnelLeaseSpec {
                endpoints: subdomain.to_string(),
                renewed_at: isotime(),
                ttl,
                reap_after,
            })
            .await?;

        // The tunnel id is the generated lease name with the subdomain
        // prefix stripped
        let lease_name = lease.name_any();
        let id = lease_name
            .strip_prefix(&format!("{}-", subdomain))
            .unwrap_or(&lease_name)
            .to_string();

        // If this insert fails the lease is left behind; the sweep's
        // reconciliation pass reclaims it once it expires.
        let ops = [EntryOp::InsertEndpoint {
            id: id.clone(),
            endpoint: TunnelEndpoint {
                address: host.to_string(),
                port,
                // Critical until the first heartbeat says otherwise
                status: EndpointStatus::Critical,
                config,
                ttl,
                reap_after,
            },
        }];
        self.patch_entry_retrying(subdomain, &ops).await?;

        debug!("Issued tunnel {} under subdomain {}", id, subdomain);
        Ok(id)
    }

    /// Record a heartbeat: advance the lease's renewal time, then update
    /// the record's status. Two independent writes; if one is lost the
    /// sweep re-derives status from the renewal time.
    pub async fn renew(&self, subdomain: &str, id: &str, status: EndpointStatus) -> Result<()> {
        let lease_name = format!("{}-{}", subdomain, id);
        let mut attempt = 0;
        loop {
            match self.store.renew_lease(&lease_name, &isotime()).await {
                Ok(()) => break,
                Err(StoreError::Conflict(_)) if attempt < CONFLICT_RETRIES => {
                    attempt += 1;
                    time::sleep(RETRY_DELAY).await;
                }
                Err(StoreError::NotFound(_)) => {
                    // The tunnel was reaped or retired; the caller must
                    // re-register rather than heartbeat it back to life.
                    return Err(RegistryError::LeaseNotFound(lease_name));
                }
                Err(StoreError::Conflict(name)) => return Err(RegistryError::Conflict(name)),
                Err(e) => return Err(e.into()),
            }
        }

        let ops = [EntryOp::SetStatus {
            id: id.to_string(),
            status,
        }];
        self.patch_entry_retrying(subdomain, &ops).await
    }

    /// Deregister a tunnel: drop its record from the entry, then delete
    /// its lease. Both halves tolerate targets that are already gone.
    pub async fn retire(&self, subdomain: &str, id: &str) -> Result<()> {
        let ops = [EntryOp::RemoveEndpoint { id: id.to_string() }];
        match self.patch_entry_retrying(subdomain, &ops).await {
            Ok(()) => {}
            Err(RegistryError::Store(StoreError::NotFound(_))) => {
                debug!("Endpoints resource for {} already gone", subdomain);
            }
            Err(e) => return Err(e),
        }
        self.store
            .delete_lease(&format!("{}-{}", subdomain, id))
            .await?;
        debug!("Retired tunnel {} under subdomain {}", id, subdomain);
        Ok(())
    }

    /// Apply entry ops, absorbing a bounded number of write conflicts
    async fn patch_entry_retrying(&self, name: &str, ops: &[EntryOp]) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.store.patch_entry(name, ops).await {
                Ok(()) => return Ok(()),
                Err(StoreError::Conflict(_)) if attempt < CONFLICT_RETRIES => {
                    attempt += 1;
                    warn!(
                        "Conflict patching {}, retrying ({}/{})",
                        name, attempt, CONFLICT_RETRIES
                    );
                    time::sleep(RETRY_DELAY).await;
                }
                Err(StoreError::Conflict(name)) => return Err(RegistryError::Conflict(name)),
                Err(e) => return Err(e.into()),
            }
        }
    }
}
