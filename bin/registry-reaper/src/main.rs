use anyhow::Result;
use registry_core::TunnelRegistry;
use registry_store::KubeStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::init as tracing_init;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_init();

    info!("Starting registry-reaper...");

    let namespace = env_or("REGISTRY_NAMESPACE", "default");
    let interval = env_seconds("REGISTRY_SWEEP_INTERVAL_SECS", 30);

    // A store connection is the precondition for everything else; failing
    // to acquire one is fatal
    let store = KubeStore::connect(&namespace).await?;
    store.apply_crds().await?;
    let store = Arc::new(store);
    info!(
        "Store connection established (namespace {}, sweep interval {:?})",
        namespace, interval
    );

    let registry = TunnelRegistry::new(store.clone(), interval);

    // Sweep until the shutdown signal arrives; dropping the loop future
    // cancels any in-flight cycle at its next await point
    tokio::select! {
        result = registry.run() => {
            if let Err(e) = result {
                error!("Sweep loop error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting...");
        }
    }

    drop(registry);
    match Arc::try_unwrap(store) {
        Ok(store) => store.shutdown(),
        Err(_) => warn!("Store connection still shared at shutdown"),
    }

    Ok(())
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
