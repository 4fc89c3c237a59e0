use anyhow::Result;
use futures::StreamExt;
use registry_core::{EventKind, ServiceFeed};
use registry_store::KubeStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::fmt::init as tracing_init;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_init();

    info!("Starting registry-watch...");

    let namespace = env_or("REGISTRY_NAMESPACE", "default");
    let retry = env_seconds("REGISTRY_WATCH_RETRY_SECS", 5);

    let store = Arc::new(KubeStore::connect(&namespace).await?);
    let feed = ServiceFeed::new(store);

    // A broken stream is not fatal: re-establish the watch from scratch
    // (fresh list plus new stream) after a short pause
    loop {
        match feed.watch().await {
            Ok((services, mut events)) => {
                info!("Watch established with {} services", services.len());
                for service in &services {
                    info!(
                        "  {} ({} routable endpoints)",
                        service.name,
                        service.endpoints.len()
                    );
                }
                while let Some(event) = events.next().await {
                    match event.kind {
                        EventKind::Created => info!(
                            "Service created: {} ({} routable endpoints)",
                            event.service.name,
                            event.service.endpoints.len()
                        ),
                        EventKind::Updated => info!(
                            "Service updated: {} ({} routable endpoints)",
                            event.service.name,
                            event.service.endpoints.len()
                        ),
                        EventKind::Deleted => {
                            info!("Service deleted: {}", event.service.name)
                        }
                    }
                }
                warn!("Watch stream ended, re-watching in {:?}", retry);
            }
            Err(e) => {
                warn!("Failed to establish watch: {}, retrying in {:?}", e, retry);
            }
        }
        tokio::time::sleep(retry).await;
    }
}

/// Read a string setting from the environment, with a default
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read a seconds setting from the environment, with a default
fn env_seconds(key: &str, default: u64) -> Duration {
    let secs = std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}
