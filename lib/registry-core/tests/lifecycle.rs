//! End-to-end lifecycle scenarios against the in-memory store

use chrono::{Duration as ChronoDuration, Utc};
use futures::StreamExt;
use kube::ResourceExt;
use registry_api::v1alpha1::{TunnelEndpointsSpec, TunnelLeaseSpec};
use registry_api::{EndpointStatus, TunnelEndpoints};
use registry_core::{Endpoint, EventKind, Reaper, RegistryError, TunnelRegistry};
use registry_store::{MemoryStore, Store};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

fn setup() -> (Arc<MemoryStore>, TunnelRegistry, Reaper) {
    let store = Arc::new(MemoryStore::new());
    let registry = TunnelRegistry::new(store.clone(), SWEEP_INTERVAL);
    let reaper = Reaper::new(store.clone(), SWEEP_INTERVAL);
    (store, registry, reaper)
}

async fn provision(store: &MemoryStore, subdomain: &str) {
    store
        .create_entry(TunnelEndpoints::new(
            subdomain,
            TunnelEndpointsSpec::default(),
        ))
        .await
        .unwrap();
}

/// Rewrite a lease's renewal time to `seconds` ago, simulating silence
async fn backdate(store: &MemoryStore, lease_name: &str, seconds: i64) {
    let past = (Utc::now() - ChronoDuration::seconds(seconds)).to_rfc3339();
    store.renew_lease(lease_name, &past).await.unwrap();
}

#[tokio::test]
async fn test_issued_tunnel_is_hidden_until_first_heartbeat() {
    let (store, registry, _) = setup();
    provision(&store, "api").await;

    let config = BTreeMap::from([("x".to_string(), serde_json::json!(1))]);
    let id = registry
        .issue("api", "10.0.0.1", 8080, 30, 300, config)
        .await
        .unwrap();

    // Critical endpoints are invisible to consumers, but their config is
    // already published
    let (initial, _) = registry.watch().await.unwrap();
    let service = initial.iter().find(|s| s.name == "api").unwrap();
    assert!(service.endpoints.is_empty());
    assert_eq!(service.config["x"], serde_json::json!(1));

    registry
        .renew("api", &id, EndpointStatus::Healthy)
        .await
        .unwrap();

    let (after, _) = registry.watch().await.unwrap();
    let service = after.iter().find(|s| s.name == "api").unwrap();
    assert_eq!(
        service.endpoints,
        vec![Endpoint {
            address: "10.0.0.1".to_string(),
            port: 8080,
        }]
    );
}

#[tokio::test]
async fn test_silence_past_ttl_goes_critical() {
    let (store, registry, reaper) = setup();
    provision(&store, "api").await;

    let id = registry
        .issue("api", "10.0.0.1", 8080, 30, 300, BTreeMap::new())
        .await
        .unwrap();
    registry
        .renew("api", &id, EndpointStatus::Healthy)
        .await
        .unwrap();

    backdate(&store, &format!("api-{}", id), 31).await;
    reaper.sweep().await.unwrap();

    let entry = store.fetch_entry("api").await.unwrap();
    assert_eq!(entry.spec.endpoints[&id].status, EndpointStatus::Critical);

    // Past ttl but within the reap window: the record stays put, and
    // further sweeps change nothing
    reaper.sweep().await.unwrap();
    let entry = store.fetch_entry("api").await.unwrap();
    assert!(entry.spec.endpoints.contains_key(&id));

    let (services, _) = registry.watch().await.unwrap();
    assert!(services[0].endpoints.is_empty());
}

#[tokio::test]
async fn test_silence_past_reap_window_removes_record_and_lease() {
    let (store, registry, reaper) = setup();
    provision(&store, "api").await;

    let id = registry
        .issue("api", "10.0.0.1", 8080, 30, 300, BTreeMap::new())
        .await
        .unwrap();
    registry
        .renew("api", &id, EndpointStatus::Healthy)
        .await
        .unwrap();

    backdate(&store, &format!("api-{}", id), 301).await;
    reaper.sweep().await.unwrap();

    let entry = store.fetch_entry("api").await.unwrap();
    assert!(entry.spec.endpoints.is_empty());
    assert!(store.list_leases().await.unwrap().is_empty());

    // Removal is terminal: the tunnel cannot heartbeat back to life
    let err = registry
        .renew("api", &id, EndpointStatus::Healthy)
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::LeaseNotFound(_)));
}

#[tokio::test]
async fn test_check_then_issue_race_both_succeed() {
    let (store, registry, _) = setup();
    provision(&store, "api").await;

    // Two registrations interleave so that both availability checks run
    // before either create. The check is advisory, so both must succeed;
    // this pins the known race rather than silently preventing it.
    assert!(registry.check_available("10.0.0.1", 8080).await.unwrap());
    assert!(registry.check_available("10.0.0.1", 8080).await.unwrap());

    let first = registry
        .issue("api", "10.0.0.1", 8080, 30, 300, BTreeMap::new())
        .await
        .unwrap();
    let second = registry
        .issue("api", "10.0.0.1", 8080, 30, 300, BTreeMap::new())
        .await
        .unwrap();
    assert_ne!(first, second);

    let entry = store.fetch_entry("api").await.unwrap();
    assert_eq!(entry.spec.endpoints.len(), 2);
    assert!(!registry.check_available("10.0.0.1", 8080).await.unwrap());
}

#[tokio::test]
async fn test_watch_event_sequence() {
    let (store, registry, _) = setup();

    let (initial, events) = registry.watch().await.unwrap();
    assert!(initial.is_empty());

    provision(&store, "api").await;
    let id = registry
        .issue("api", "10.0.0.1", 8080, 30, 300, BTreeMap::new())
        .await
        .unwrap();
    registry
        .renew("api", &id, EndpointStatus::Healthy)
        .await
        .unwrap();
    registry.retire("api", &id).await.unwrap();
    store.delete_entry("api").await.unwrap();

    let collected: Vec<_> = events.take(5).collect().await;
    let kinds: Vec<EventKind> = collected.iter().map(|event| event.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Created,
            EventKind::Updated,
            EventKind::Updated,
            EventKind::Updated,
            EventKind::Deleted,
        ]
    );

    // The heartbeat's event carries the promoted endpoint; retirement
    // empties it again
    assert_eq!(collected[2].service.endpoints.len(), 1);
    assert!(collected[3].service.endpoints.is_empty());
    assert_eq!(collected[4].service.name, "api");
}

#[tokio::test]
async fn test_orphaned_leases_are_reclaimed_once_expired() {
    let (store, _, reaper) = setup();
    provision(&store, "api").await;

    // A lease without a record, as left behind by a crash between
    // lease-create and record-insert
    let expired = store
        .create_lease(TunnelLeaseSpec {
            endpoints: "api".to_string(),
            renewed_at: (Utc::now() - ChronoDuration::seconds(31)).to_rfc3339(),
            ttl: 30,
            reap_after: 300,
        })
        .await
        .unwrap();
    // A fresh one could be an in-flight registration and must be left alone
    let fresh = store
        .create_lease(TunnelLeaseSpec {
            endpoints: "api".to_string(),
            renewed_at: Utc::now().to_rfc3339(),
            ttl: 30,
            reap_after: 300,
        })
        .await
        .unwrap();

    reaper.sweep().await.unwrap();

    let names: Vec<String> = store
        .list_leases()
        .await
        .unwrap()
        .iter()
        .map(|lease| lease.name_any())
        .collect();
    assert!(!names.contains(&expired.name_any()));
    assert!(names.contains(&fresh.name_any()));
}

#[tokio::test]
async fn test_lease_whose_entry_is_gone_is_reclaimed() {
    let (store, registry, reaper) = setup();
    provision(&store, "api").await;

    let id = registry
        .issue("api", "10.0.0.1", 8080, 30, 300, BTreeMap::new())
        .await
        .unwrap();
    store.delete_entry("api").await.unwrap();

    // Still within its ttl: not yet reclaimable
    reaper.sweep().await.unwrap();
    assert_eq!(store.list_leases().await.unwrap().len(), 1);

    backdate(&store, &format!("api-{}", id), 31).await;
    reaper.sweep().await.unwrap();
    assert!(store.list_leases().await.unwrap().is_empty());
}
