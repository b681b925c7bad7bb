//! Google Cloud Platform backends

mod gcs_store;

pub use gcs_store::GcsObjectStore;
