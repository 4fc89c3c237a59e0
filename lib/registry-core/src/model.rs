//! Consumer-facing service model
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A routable address published for a service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

/// The published view of one subdomain: its routable endpoints and the
/// merged configuration of every member tunnel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub endpoints: Vec<Endpoint>,
    pub config: BTreeMap<String, serde_json::Value>,
}

/// What happened to a service
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

/// A change to a service. Carries the full fresh snapshot, not a diff.
#[derive(Clone, Debug)]
pub struct Event {
    pub kind: EventKind,
    pub service: Service,
}
