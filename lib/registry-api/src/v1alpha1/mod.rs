/// API version v1alpha1 for tunnel registry CRDs

pub mod tunnel_endpoints;
pub mod tunnel_lease;

pub use tunnel_endpoints::{EndpointStatus, TunnelEndpoint, TunnelEndpoints, TunnelEndpointsSpec};
pub use tunnel_lease::{TunnelLease, TunnelLeaseSpec};

/// API group for tunnel registry resources
pub const API_GROUP: &str = "tunnels.datum.net";
/// API version for tunnel registry resources
pub const API_VERSION: &str = "v1alpha1";
