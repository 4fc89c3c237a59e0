use registry_store::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("No endpoints resource for subdomain: {0}")]
    EntryNotFound(String),

    #[error("No lease for tunnel: {0}")]
    LeaseNotFound(String),

    #[error("Write conflict persisted after retries: {0}")]
    Conflict(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}
