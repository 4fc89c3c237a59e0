use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// TunnelLease is the liveness token paired 1:1 with an endpoint record.
/// Its name is `<subdomain>-<id>`, where the id is the store-generated
/// suffix; heartbeats advance `renewed_at`.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "tunnels.datum.net",
    version = "v1alpha1",
    kind = "TunnelLease",
    plural = "tunnelleases",
    namespaced,
    derive = "Default",
    printcolumn = r#"{"name":"Renewed","type":"string","jsonPath":".spec.renewedAt"}"#,
)]
#[serde(rename_all = "camelCase")]
pub struct TunnelLeaseSpec {
    /// Name of the TunnelEndpoints resource this lease belongs to
    pub endpoints: String,

    /// RFC3339 time of the most recent heartbeat
    pub renewed_at: String,

    /// Seconds without renewal before the endpoint goes critical
    pub ttl: u32,

    /// Seconds without renewal before the endpoint is reaped
    pub reap_after: u32,
}
