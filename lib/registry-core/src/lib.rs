//! Core tunnel registry functionality
//!
//! This library provides:
//! - Lease-scoped tunnel registration, heartbeats, and retirement
//! - The periodic health sweep that downgrades and reaps silent endpoints
//! - Translation of raw store notifications into typed service events

pub mod error;
pub mod feed;
pub mod lease;
pub mod model;
pub mod reaper;
pub mod registry;

pub use error::{RegistryError, Result};
pub use feed::{snapshot, ServiceFeed};
pub use lease::LeaseManager;
pub use model::{Endpoint, Event, EventKind, Service};
pub use reaper::Reaper;
pub use registry::TunnelRegistry;
