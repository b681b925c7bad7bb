//! Object store providers
//!
//! The pipeline talks to storage only through [`ObjectStore`]; backends are
//! chosen at startup from [`StoreConfig`].

pub mod local;
pub mod memory;
pub mod object_store;

#[cfg(feature = "gcp")]
pub mod gcp;

use std::sync::Arc;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::{Error, Result};

pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;
pub use object_store::{list_all, list_keys, ListPage, ObjectMetadata, ObjectStore};

/// Open the configured object store
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match config.backend {
        StoreBackend::Local => Arc::new(LocalObjectStore::new(config.root.clone())?),
        StoreBackend::Memory => Arc::new(MemoryObjectStore::new()),
        StoreBackend::Gcs => open_gcs(config).await?,
    };

    tracing::info!("Object store ready: {}", store.name());
    Ok(store)
}

#[cfg(feature = "gcp")]
async fn open_gcs(config: &StoreConfig) -> Result<Arc<dyn ObjectStore>> {
    let bucket = config
        .bucket
        .clone()
        .ok_or_else(|| Error::Config("store.bucket is required for the gcs backend".to_string()))?;
    Ok(Arc::new(gcp::GcsObjectStore::new(bucket).await?))
}

#[cfg(not(feature = "gcp"))]
async fn open_gcs(_config: &StoreConfig) -> Result<Arc<dyn ObjectStore>> {
    Err(Error::Config(
        "gcs backend requires building with the `gcp` feature".to_string(),
    ))
}
