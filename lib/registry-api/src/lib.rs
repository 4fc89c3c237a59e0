//! Tunnel registry API types and CRDs for Kubernetes integration
//!
//! This library defines the custom resources backing the tunnel registry:
//! - TunnelEndpoints: all live tunnel endpoints for one routable subdomain
//! - TunnelLease: the per-tunnel liveness token driving health and reaping

pub mod v1alpha1;

pub use v1alpha1::{EndpointStatus, TunnelEndpoint, TunnelEndpoints, TunnelLease};
