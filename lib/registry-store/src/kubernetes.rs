//! Kubernetes-backed store implementation

use crate::error::{Result, StoreError};
use crate::store::{EntryEvent, EntryEventStream, EntryOp, Store};
use async_trait::async_trait;
use futures::{future, StreamExt};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{
    DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams, WatchEvent, WatchParams,
};
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use registry_api::v1alpha1::{TunnelEndpoints, TunnelLease, TunnelLeaseSpec};
use tracing::{debug, warn};

/// Field manager used for server-side apply
const FIELD_MANAGER: &str = "tunnel-registry";

/// KubeStore keeps the registry state in TunnelEndpoints and TunnelLease
/// custom resources inside a single namespace.
pub struct KubeStore {
    client: Client,
    namespace: String,
}

impl KubeStore {
    /// Connect to the cluster from the environment. Failure here is fatal
    /// to the subsystem; nothing may run without the connection.
    pub async fn connect(namespace: &str) -> Result<Self> {
        let client = Client::try_default().await?;
        debug!("Connected to Kubernetes, target namespace {}", namespace);
        Ok(Self {
            client,
            namespace: namespace.to_string(),
        })
    }

    /// Apply the registry CRDs with server-side apply, so a fresh cluster
    /// needs no out-of-band setup.
    pub async fn apply_crds(&self) -> Result<()> {
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let params = PatchParams::apply(FIELD_MANAGER).force();
        for crd in [TunnelEndpoints::crd(), TunnelLease::crd()] {
            let name = crd.name_any();
            crds.patch(&name, &params, &Patch::Apply(&crd)).await?;
            debug!("Applied CRD {}", name);
        }
        Ok(())
    }

    /// Release the store connection. The client closes its connections
    /// when dropped; in-flight calls observe cancellation at their next
    /// await point.
    pub fn shutdown(self) {
        debug!("Store connection released");
    }

    fn entries(&self) -> Api<TunnelEndpoints> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn leases(&self) -> Api<TunnelLease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// Map Kubernetes API errors onto store errors, so callers can tell
/// missing objects and write conflicts apart from transport failures.
fn store_error(name: &str, err: kube::error::Error) -> StoreError {
    match &err {
        kube::error::Error::Api(response) if response.code == 404 => {
            StoreError::NotFound(name.to_string())
        }
        kube::error::Error::Api(response) if response.code == 409 => {
            StoreError::Conflict(name.to_string())
        }
        _ => StoreError::Kubernetes(err),
    }
}

/// Collapse a batch of entry ops into one JSON merge patch. A removal maps
/// to a null value, which deletes the key under merge-patch semantics.
fn merge_patch(ops: &[EntryOp]) -> Result<serde_json::Value> {
    let mut endpoints = serde_json::Map::new();
    for op in ops {
        match op {
            EntryOp::InsertEndpoint { id, endpoint } => {
                endpoints.insert(id.clone(), serde_json::to_value(endpoint)?);
            }
            EntryOp::SetStatus { id, status } => {
                endpoints.insert(id.clone(), serde_json::json!({ "status": status }));
            }
            EntryOp::RemoveEndpoint { id } => {
                endpoints.insert(id.clone(), serde_json::Value::Null);
            }
        }
    }
    Ok(serde_json::json!({ "spec": { "endpoints": endpoints } }))
}

#[async_trait]
impl Store for KubeStore {
    async fn fetch_entry(&self, name: &str) -> Result<TunnelEndpoints> {
        self.entries()
            .get(name)
            .await
            .map_err(|e| store_error(name, e))
    }

    async fn create_entry(&self, entry: TunnelEndpoints) -> Result<TunnelEndpoints> {
        let name = entry.name_any();
        self.entries()
            .create(&PostParams::default(), &entry)
            .await
            .map_err(|e| store_error(&name, e))
    }

    async fn delete_entry(&self, name: &str) -> Result<()> {
        match self.entries().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => match store_error(name, e) {
                StoreError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn list_entries(&self) -> Result<Vec<TunnelEndpoints>> {
        let list = self.entries().list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn patch_entry(&self, name: &str, ops: &[EntryOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let patch = merge_patch(ops)?;
        self.entries()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| store_error(name, e))?;
        Ok(())
    }

    async fn watch_entries(&self) -> Result<(Vec<TunnelEndpoints>, EntryEventStream)> {
        let api = self.entries();
        // Watching from the list's resource version leaves no gap between
        // the initial snapshot and the stream.
        let list = api.list(&ListParams::default()).await?;
        let version = list.metadata.resource_version.clone().unwrap_or_default();
        let raw = api.watch(&WatchParams::default(), &version).await?;
        let events = raw
            .scan((), |_, item| {
                future::ready(match item {
                    Ok(WatchEvent::Added(entry)) => Some(EntryEvent::Added(entry)),
                    Ok(WatchEvent::Modified(entry)) => Some(EntryEvent::Modified(entry)),
                    Ok(WatchEvent::Deleted(entry)) => Some(EntryEvent::Deleted(entry)),
                    Ok(WatchEvent::Bookmark(_)) => Some(EntryEvent::Other),
                    Ok(WatchEvent::Error(response)) => {
                        // Usually an expired watch; the consumer recovers by
                        // calling watch_entries again from scratch.
                        warn!("Watch stream ended with error response: {}", response);
                        None
                    }
                    Err(e) => {
                        warn!("Watch stream transport error: {}", e);
                        None
                    }
                })
            })
            .boxed();
        Ok((list.items, events))
    }

    async fn create_lease(&self, spec: TunnelLeaseSpec) -> Result<TunnelLease> {
        let owner = spec.endpoints.clone();
        let mut lease = TunnelLease::new("", spec);
        // Let the API server pick the unique suffix; the generated name is
        // where the tunnel id comes from.
        lease.metadata = ObjectMeta {
            generate_name: Some(format!("{}-", owner)),
            ..Default::default()
        };
        self.leases()
            .create(&PostParams::default(), &lease)
            .await
            .map_err(|e| store_error(&owner, e))
    }

    async fn renew_lease(&self, name: &str, renewed_at: &str) -> Result<()> {
        let patch = serde_json::json!({ "spec": { "renewedAt": renewed_at } });
        self.leases()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| store_error(name, e))?;
        Ok(())
    }

    async fn list_leases(&self) -> Result<Vec<TunnelLease>> {
        let list = self.leases().list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn delete_lease(&self, name: &str) -> Result<()> {
        match self.leases().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => match store_error(name, e) {
                StoreError::NotFound(_) => Ok(()),
                other => Err(other),
            },
        }
    }
}
