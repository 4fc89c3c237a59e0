//! In-memory store for tests and local development

use crate::error::{Result, StoreError};
use crate::store::{EntryEvent, EntryEventStream, EntryOp, Store};
use async_trait::async_trait;
use futures::StreamExt;
use kube::ResourceExt;
use registry_api::v1alpha1::{TunnelEndpoints, TunnelLease, TunnelLeaseSpec};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// MemoryStore keeps the registry state in process, behind one mutex.
/// It backs the test suite and local development, where no cluster is
/// available, with the same per-object atomicity as the real store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    conflicts: AtomicU32,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, TunnelEndpoints>,
    leases: HashMap<String, TunnelLease>,
    watchers: Vec<mpsc::UnboundedSender<EntryEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` entry/lease patches with a conflict, so the
    /// callers' retry paths can be exercised.
    pub fn inject_conflicts(&self, count: u32) {
        self.conflicts.store(count, Ordering::SeqCst);
    }

    fn take_conflict(&self) -> bool {
        self.conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Fan an event out to every live watcher, dropping closed ones.
    fn broadcast(state: &mut State, event: EntryEvent) {
        state.watchers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn fetch_entry(&self, name: &str) -> Result<TunnelEndpoints> {
        let state = self.state.lock().await;
        state
            .entries
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn create_entry(&self, entry: TunnelEndpoints) -> Result<TunnelEndpoints> {
        let name = entry.name_any();
        let mut state = self.state.lock().await;
        if state.entries.contains_key(&name) {
            return Err(StoreError::Conflict(name));
        }
        state.entries.insert(name, entry.clone());
        Self::broadcast(&mut state, EntryEvent::Added(entry.clone()));
        Ok(entry)
    }

    async fn delete_entry(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.remove(name) {
            Self::broadcast(&mut state, EntryEvent::Deleted(entry));
        }
        Ok(())
    }

    async fn list_entries(&self) -> Result<Vec<TunnelEndpoints>> {
        let state = self.state.lock().await;
        Ok(state.entries.values().cloned().collect())
    }

    async fn patch_entry(&self, name: &str, ops: &[EntryOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        if self.take_conflict() {
            return Err(StoreError::Conflict(name.to_string()));
        }
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        for op in ops {
            match op {
                EntryOp::InsertEndpoint { id, endpoint } => {
                    entry.spec.endpoints.insert(id.clone(), endpoint.clone());
                }
                EntryOp::SetStatus { id, status } => {
                    if let Some(endpoint) = entry.spec.endpoints.get_mut(id) {
                        endpoint.status = *status;
                    }
                }
                EntryOp::RemoveEndpoint { id } => {
                    entry.spec.endpoints.remove(id);
                }
            }
        }
        let updated = entry.clone();
        Self::broadcast(&mut state, EntryEvent::Modified(updated));
        Ok(())
    }

    async fn watch_entries(&self) -> Result<(Vec<TunnelEndpoints>, EntryEventStream)> {
        let mut state = self.state.lock().await;
        let initial: Vec<TunnelEndpoints> = state.entries.values().cloned().collect();
        let (tx, rx) = mpsc::unbounded_channel();
        state.watchers.push(tx);
        let events = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed();
        Ok((initial, events))
    }

    async fn create_lease(&self, spec: TunnelLeaseSpec) -> Result<TunnelLease> {
        let mut state = self.state.lock().await;
        let name = loop {
            let suffix = Uuid::new_v4().simple().to_string();
            let candidate = format!("{}-{}", spec.endpoints, &suffix[..5]);
            if !state.leases.contains_key(&candidate) {
                break candidate;
            }
        };
        let lease = TunnelLease::new(&name, spec);
        state.leases.insert(name, lease.clone());
        Ok(lease)
    }

    async fn renew_lease(&self, name: &str, renewed_at: &str) -> Result<()> {
        if self.take_conflict() {
            return Err(StoreError::Conflict(name.to_string()));
        }
        let mut state = self.state.lock().await;
        let lease = state
            .leases
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        lease.spec.renewed_at = renewed_at.to_string();
        Ok(())
    }

    async fn list_leases(&self) -> Result<Vec<TunnelLease>> {
        let state = self.state.lock().await;
        Ok(state.leases.values().cloned().collect())
    }

    async fn delete_lease(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.leases.remove(name);
        Ok(())
    }
}
