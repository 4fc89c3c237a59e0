use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// TunnelEndpoints aggregates every live tunnel endpoint for one routable
/// subdomain. The resource must already exist before a tunnel can register
/// under it; provisioning it is the platform layer's job, not this system's.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "tunnels.datum.net",
    version = "v1alpha1",
    kind = "TunnelEndpoints",
    plural = "tunnelendpoints",
    namespaced,
    derive = "Default",
    printcolumn = r#"{"name":"Owner","type":"string","jsonPath":".spec.owner"}"#,
)]
pub struct TunnelEndpointsSpec {
    /// Identity that provisioned this subdomain
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    /// Tunnel id to endpoint record
    #[serde(default)]
    pub endpoints: BTreeMap<String, TunnelEndpoint>,
}

/// One tunnel's registration under a subdomain
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TunnelEndpoint {
    /// Host the tunnelled service is reachable on
    pub address: String,

    /// Port the tunnelled service is reachable on
    pub port: u16,

    /// Health as reported by the most recent heartbeat
    pub status: EndpointStatus,

    /// Client-supplied configuration, opaque to the registry
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,

    /// Seconds without a heartbeat before the endpoint goes critical
    pub ttl: u32,

    /// Seconds without a heartbeat before the endpoint is removed entirely.
    /// Callers keep this >= ttl.
    pub reap_after: u32,
}

/// Health of a tunnel endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    /// Not trusted for traffic: freshly registered or past its ttl
    Critical,
    /// Confirmed alive by a heartbeat
    Healthy,
}

impl Default for EndpointStatus {
    fn default() -> Self {
        EndpointStatus::Critical
    }
}
