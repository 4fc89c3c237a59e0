//! Periodic health sweep and garbage collection

use crate::error::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use kube::ResourceExt;
use registry_api::{EndpointStatus, TunnelEndpoint, TunnelEndpoints, TunnelLease};
use registry_store::{EntryOp, Store, StoreError};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What the sweep decided for one endpoint record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SweepAction {
    /// Past its reap window, or unrecoverable: remove the record
    Remove,
    /// Past its ttl while marked healthy: downgrade to critical
    Downgrade,
}

/// Decide what to do with one record given its paired lease.
///
/// Removal applies regardless of status once the reap window passes; the
/// downgrade only ever moves non-critical records to critical. A record
/// with no lease can never heartbeat again (renewal patches the lease
/// first), so it is removed outright.
fn endpoint_action(
    id: &str,
    endpoint: &TunnelEndpoint,
    lease: Option<&TunnelLease>,
    now: DateTime<Utc>,
) -> Option<SweepAction> {
    let lease = match lease {
        Some(lease) => lease,
        None => {
            debug!("Endpoint {} has no lease, removing", id);
            return Some(SweepAction::Remove);
        }
    };
    let renewed_at = match DateTime::parse_from_rfc3339(&lease.spec.renewed_at) {
        Ok(parsed) => parsed.with_timezone(&Utc),
        Err(e) => {
            warn!("Endpoint {} has an unreadable renewal time ({}), removing", id, e);
            return Some(SweepAction::Remove);
        }
    };
    if renewed_at + ChronoDuration::seconds(endpoint.reap_after as i64) < now {
        Some(SweepAction::Remove)
    } else if endpoint.status != EndpointStatus::Critical
        && renewed_at + ChronoDuration::seconds(endpoint.ttl as i64) < now
    {
        Some(SweepAction::Downgrade)
    } else {
        None
    }
}

/// Compute the batch of patch ops one entry needs
fn sweep_ops(
    entry: &TunnelEndpoints,
    leases: &HashMap<String, TunnelLease>,
    now: DateTime<Utc>,
) -> Vec<EntryOp> {
    let name = entry.name_any();
    let mut ops = Vec::new();
    for (id, endpoint) in &entry.spec.endpoints {
        let lease = leases.get(&format!("{}-{}", name, id));
        match endpoint_action(id, endpoint, lease, now) {
            Some(SweepAction::Remove) => ops.push(EntryOp::RemoveEndpoint { id: id.clone() }),
            Some(SweepAction::Downgrade) => ops.push(EntryOp::SetStatus {
                id: id.clone(),
                status: EndpointStatus::Critical,
            }),
            None => {}
        }
    }
    ops
}

/// Whether a lease is past its own ttl. Gates orphan reclamation, so a
/// registration that has created its lease but not yet inserted its
/// record is never mistaken for garbage.
fn lease_expired(lease: &TunnelLease, now: DateTime<Utc>) -> bool {
    match DateTime::parse_from_rfc3339(&lease.spec.renewed_at) {
        Ok(parsed) => {
            parsed.with_timezone(&Utc) + ChronoDuration::seconds(lease.spec.ttl as i64) < now
        }
        Err(_) => true,
    }
}

/// Reaper sweeps the whole directory on an interval: endpoints past their
/// ttl go critical, endpoints past their reap window are removed, and
/// leases whose entry or record no longer exists are reclaimed.
pub struct Reaper {
    store: Arc<dyn Store>,
    interval: Duration,
}

impl Reaper {
    pub fn new(store: Arc<dyn Store>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Sweep forever. Every action is idempotent, so any number of
    /// replicas can run this loop without coordination. Cancellation is
    /// observed at the await points; drive this future under a select
    /// with the shutdown signal.
    pub async fn run(&self) -> Result<()> {
        info!("Starting endpoint sweep loop, interval {:?}", self.interval);
        loop {
            if let Err(e) = self.sweep().await {
                // Transient store trouble; the next cycle re-derives
                // everything from scratch.
                warn!("Sweep failed: {}", e);
            }
            tokio::time::sleep(self.interval).await;
        }
    }

    /// One full pass over every entry and lease
    pub async fn sweep(&self) -> Result<()> {
        let now = Utc::now();
        let entries = self.store.list_entries().await?;
        let leases: HashMap<String, TunnelLease> = self
            .store
            .list_leases()
            .await?
            .into_iter()
            .map(|lease| (lease.name_any(), lease))
            .collect();

        // Leases whose record was removed in this pass, so reclamation
        // does not have to wait a full extra cycle
        let mut reaped: HashSet<String> = HashSet::new();

        for entry in &entries {
            let name = entry.name_any();
            let ops = sweep_ops(entry, &leases, now);
            if ops.is_empty() {
                continue;
            }
            debug!("Applying {} sweep ops to {}", ops.len(), name);
            match self.store.patch_entry(&name, &ops).await {
                Ok(()) => {
                    for op in &ops {
                        if let EntryOp::RemoveEndpoint { id } = op {
                            reaped.insert(format!("{}-{}", name, id));
                        }
                    }
                }
                // Entry gone or concurrently rewritten; the next cycle
                // re-derives the same decision.
                Err(StoreError::NotFound(_)) | Err(StoreError::Conflict(_)) => {}
                Err(e) => warn!("Failed to patch {}: {}", name, e),
            }
        }

        self.reclaim_orphans(&entries, &leases, &reaped, now).await;
        Ok(())
    }

    /// Delete expired leases whose entry is gone or no longer lists their
    /// record. Replaces the store-native owner-cascade: retirement removes
    /// the record and lease explicitly, and anything that slips through a
    /// partial failure converges here.
    async fn reclaim_orphans(
        &self,
        entries: &[TunnelEndpoints],
        leases: &HashMap<String, TunnelLease>,
        reaped: &HashSet<String>,
        now: DateTime<Utc>,
    ) {
        let by_name: HashMap<String, &TunnelEndpoints> = entries
            .iter()
            .map(|entry| (entry.name_any(), entry))
            .collect();
        for (name, lease) in leases {
            let owner = &lease.spec.endpoints;
            let id = match name.strip_prefix(&format!("{}-", owner)) {
                Some(id) => id,
                None => continue,
            };
            let owned = !reaped.contains(name)
                && by_name
                    .get(owner)
                    .map(|entry| entry.spec.endpoints.contains_key(id))
                    .unwrap_or(false);
            if owned || !lease_expired(lease, now) {
                continue;
            }
            debug!("Reclaiming orphaned lease {}", name);
            if let Err(e) = self.store.delete_lease(name).await {
                warn!("Failed to delete orphaned lease {}: {}", name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry_api::v1alpha1::{TunnelEndpointsSpec, TunnelLeaseSpec};
    use std::collections::BTreeMap;

    fn endpoint(status: EndpointStatus, ttl: u32, reap_after: u32) -> TunnelEndpoint {
        TunnelEndpoint {
            address: "10.0.0.1".to_string(),
            port: 8080,
            status,
            config: BTreeMap::new(),
            ttl,
            reap_after,
        }
    }

    fn lease(owner: &str, id: &str, renewed_at: DateTime<Utc>, ttl: u32) -> TunnelLease {
        TunnelLease::new(
            &format!("{}-{}", owner, id),
            TunnelLeaseSpec {
                endpoints: owner.to_string(),
                renewed_at: renewed_at.to_rfc3339(),
                ttl,
                reap_after: 300,
            },
        )
    }

    fn seconds_ago(now: DateTime<Utc>, seconds: i64) -> DateTime<Utc> {
        now - ChronoDuration::seconds(seconds)
    }

    #[test]
    fn test_fresh_endpoint_is_left_alone() {
        let now = Utc::now();
        let lease = lease("api", "t1", now, 30);
        let action = endpoint_action(
            "t1",
            &endpoint(EndpointStatus::Healthy, 30, 300),
            Some(&lease),
            now,
        );
        assert_eq!(action, None);
    }

    #[test]
    fn test_healthy_endpoint_past_ttl_is_downgraded() {
        let now = Utc::now();
        let lease = lease("api", "t1", seconds_ago(now, 31), 30);
        let action = endpoint_action(
            "t1",
            &endpoint(EndpointStatus::Healthy, 30, 300),
            Some(&lease),
            now,
        );
        assert_eq!(action, Some(SweepAction::Downgrade));
    }

    #[test]
    fn test_critical_endpoint_past_ttl_is_left_alone() {
        let now = Utc::now();
        let lease = lease("api", "t1", seconds_ago(now, 31), 30);
        let action = endpoint_action(
            "t1",
            &endpoint(EndpointStatus::Critical, 30, 300),
            Some(&lease),
            now,
        );
        assert_eq!(action, None);
    }

    #[test]
    fn test_endpoint_past_reap_window_is_removed_regardless_of_status() {
        let now = Utc::now();
        let lease = lease("api", "t1", seconds_ago(now, 301), 30);
        for status in [EndpointStatus::Critical, EndpointStatus::Healthy] {
            let action = endpoint_action("t1", &endpoint(status, 30, 300), Some(&lease), now);
            assert_eq!(action, Some(SweepAction::Remove));
        }
    }

    #[test]
    fn test_endpoint_without_lease_is_removed() {
        let now = Utc::now();
        let action = endpoint_action("t1", &endpoint(EndpointStatus::Healthy, 30, 300), None, now);
        assert_eq!(action, Some(SweepAction::Remove));
    }

    #[test]
    fn test_unreadable_renewal_time_is_removed() {
        let now = Utc::now();
        let mut bad = lease("api", "t1", now, 30);
        bad.spec.renewed_at = "not-a-time".to_string();
        let action = endpoint_action(
            "t1",
            &endpoint(EndpointStatus::Healthy, 30, 300),
            Some(&bad),
            now,
        );
        assert_eq!(action, Some(SweepAction::Remove));
    }

    #[test]
    fn test_sweep_ops_batches_downgrades_and_removals() {
        let now = Utc::now();
        let mut spec = TunnelEndpointsSpec::default();
        spec.endpoints
            .insert("fresh".to_string(), endpoint(EndpointStatus::Healthy, 30, 300));
        spec.endpoints
            .insert("stale".to_string(), endpoint(EndpointStatus::Healthy, 30, 300));
        spec.endpoints
            .insert("dead".to_string(), endpoint(EndpointStatus::Healthy, 30, 300));
        let entry = TunnelEndpoints::new("api", spec);

        let mut leases = HashMap::new();
        leases.insert("api-fresh".to_string(), lease("api", "fresh", now, 30));
        leases.insert(
            "api-stale".to_string(),
            lease("api", "stale", seconds_ago(now, 31), 30),
        );
        leases.insert(
            "api-dead".to_string(),
            lease("api", "dead", seconds_ago(now, 301), 30),
        );

        let ops = sweep_ops(&entry, &leases, now);
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().any(|op| matches!(
            op,
            EntryOp::RemoveEndpoint { id } if id == "dead"
        )));
        assert!(ops.iter().any(|op| matches!(
            op,
            EntryOp::SetStatus { id, status: EndpointStatus::Critical } if id == "stale"
        )));
    }

    #[test]
    fn test_lease_expiry_gates_reclamation() {
        let now = Utc::now();
        assert!(!lease_expired(&lease("api", "t1", now, 30), now));
        assert!(lease_expired(
            &lease("api", "t1", seconds_ago(now, 31), 30),
            now
        ));
        let mut bad = lease("api", "t1", now, 30);
        bad.spec.renewed_at = "garbage".to_string();
        assert!(lease_expired(&bad, now));
    }
}
