//! The store adapter contract

use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use registry_api::v1alpha1::{TunnelEndpoints, TunnelLease, TunnelLeaseSpec};
use registry_api::{EndpointStatus, TunnelEndpoint};

/// A single mutation against one TunnelEndpoints resource. A batch of ops
/// applies to the entry atomically: all of them or none.
#[derive(Clone, Debug)]
pub enum EntryOp {
    /// Insert (or replace) the record under the given id
    InsertEndpoint { id: String, endpoint: TunnelEndpoint },
    /// Overwrite the record's status, leaving its other fields alone
    SetStatus { id: String, status: EndpointStatus },
    /// Drop the record; an absent id is tolerated
    RemoveEndpoint { id: String },
}

/// Raw change notification from the store's watch stream
#[derive(Clone, Debug)]
pub enum EntryEvent {
    Added(TunnelEndpoints),
    Modified(TunnelEndpoints),
    Deleted(TunnelEndpoints),
    /// Bookmark or unrecognised notification; consumers drop these silently
    Other,
}

/// The raw notification stream. It ends on transport failure or an expired
/// watch; recovery is a fresh `watch_entries` call, never a resume.
pub type EntryEventStream = BoxStream<'static, EntryEvent>;

/// Narrow contract over the backing object store.
///
/// Every operation is a blocking round trip with per-object atomicity and
/// nothing more: no transactions across objects, no locks. Callers are
/// expected to tolerate stale reads and to converge through idempotent
/// re-application rather than coordination.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Fetch one directory entry by name
    async fn fetch_entry(&self, name: &str) -> Result<TunnelEndpoints>;

    /// Create a directory entry. Registration never does this; it is the
    /// provisioner's operation, exercised here by tests and tooling.
    async fn create_entry(&self, entry: TunnelEndpoints) -> Result<TunnelEndpoints>;

    /// Delete a directory entry; a missing target is a no-op
    async fn delete_entry(&self, name: &str) -> Result<()>;

    /// List every directory entry
    async fn list_entries(&self) -> Result<Vec<TunnelEndpoints>>;

    /// Apply a batch of ops to one entry as a single partial update
    async fn patch_entry(&self, name: &str, ops: &[EntryOp]) -> Result<()>;

    /// List-then-watch: a snapshot of every entry plus the stream of raw
    /// change notifications from that point on, with no gap between them.
    async fn watch_entries(&self) -> Result<(Vec<TunnelEndpoints>, EntryEventStream)>;

    /// Create a lease, generating a unique name from the
    /// `<spec.endpoints>-` template. Returns the created object including
    /// its generated name.
    async fn create_lease(&self, spec: TunnelLeaseSpec) -> Result<TunnelLease>;

    /// Patch a lease's renewal time
    async fn renew_lease(&self, name: &str, renewed_at: &str) -> Result<()>;

    /// List every lease
    async fn list_leases(&self) -> Result<Vec<TunnelLease>>;

    /// Delete a lease; a missing target is a no-op
    async fn delete_lease(&self, name: &str) -> Result<()>;
}
