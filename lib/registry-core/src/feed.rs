//! Translation of raw store notifications into service events

use crate::error::Result;
use crate::model::{Endpoint, Event, EventKind, Service};
use futures::stream::BoxStream;
use futures::{future, StreamExt};
use kube::ResourceExt;
use registry_api::{EndpointStatus, TunnelEndpoints};
use registry_store::{EntryEvent, Store};
use std::sync::Arc;

/// Derive the published view of one entry. Only non-critical endpoints
/// are routable; the member configs merge with later ids overwriting
/// earlier ones on key collision, so callers must not rely on which
/// tunnel a config key came from.
pub fn snapshot(entry: &TunnelEndpoints) -> Service {
    Service {
        name: entry.name_any(),
        endpoints: entry
            .spec
            .endpoints
            .values()
            .filter(|endpoint| endpoint.status != EndpointStatus::Critical)
            .map(|endpoint| Endpoint {
                address: endpoint.address.clone(),
                port: endpoint.port,
            })
            .collect(),
        config: entry
            .spec
            .endpoints
            .values()
            .flat_map(|endpoint| endpoint.config.clone())
            .collect(),
    }
}

/// ServiceFeed turns the store's raw watch stream into typed service
/// events for the routing layer.
pub struct ServiceFeed {
    store: Arc<dyn Store>,
}

impl ServiceFeed {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// List-then-watch the directory. Returns one `Service` per existing
    /// entry plus the unbounded event stream. Events carry a fresh
    /// snapshot and arrive in the order the store reports them; unknown
    /// notification kinds are dropped. When the stream ends, recovery is
    /// another `watch` call from scratch, never a resume.
    pub async fn watch(&self) -> Result<(Vec<Service>, BoxStream<'static, Event>)> {
        let (initial, raw) = self.store.watch_entries().await?;
        let services = initial.iter().map(snapshot).collect();
        let events = raw
            .filter_map(|event| {
                future::ready(match event {
                    EntryEvent::Added(entry) => Some(Event {
                        kind: EventKind::Created,
                        service: snapshot(&entry),
                    }),
                    EntryEvent::Modified(entry) => Some(Event {
                        kind: EventKind::Updated,
                        service: snapshot(&entry),
                    }),
                    EntryEvent::Deleted(entry) => Some(Event {
                        kind: EventKind::Deleted,
                        service: snapshot(&entry),
                    }),
                    EntryEvent::Other => None,
                })
            })
            .boxed();
        Ok((services, events))
    }
}
