//! Google Cloud Storage object store
//!
//! Stage objects map one-to-one onto bucket objects; sidecar metadata is
//! stored as GCS custom object metadata.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};

use google_cloud_storage::client::{Client as GcsClient, ClientConfig};
use google_cloud_storage::http::objects::Object;
use google_cloud_storage::http::objects::delete::DeleteObjectRequest;
use google_cloud_storage::http::objects::download::Range;
use google_cloud_storage::http::objects::get::GetObjectRequest;
use google_cloud_storage::http::objects::list::ListObjectsRequest;
use google_cloud_storage::http::objects::upload::{UploadObjectRequest, UploadType};

use crate::error::{Error, Result};
use crate::providers::object_store::{ListPage, ObjectMetadata, ObjectStore};

/// Google Cloud Storage object store
pub struct GcsObjectStore {
    client: GcsClient,
    bucket: String,
}

impl GcsObjectStore {
    /// Create a store for `bucket` using application default credentials
    pub async fn new(bucket: impl Into<String>) -> Result<Self> {
        let config = ClientConfig::default()
            .with_auth()
            .await
            .map_err(|e| Error::Config(format!("Failed to create GCS client: {}", e)))?;

        Ok(Self {
            client: GcsClient::new(config),
            bucket: bucket.into(),
        })
    }

    fn get_request(&self, key: &str) -> GetObjectRequest {
        GetObjectRequest {
            bucket: self.bucket.clone(),
            object: key.to_string(),
            ..Default::default()
        }
    }
}

fn is_not_found(err: &google_cloud_storage::http::Error) -> bool {
    matches!(err, google_cloud_storage::http::Error::Response(resp) if resp.code == 404)
}

fn unavailable(action: &str, key: &str, err: google_cloud_storage::http::Error) -> Error {
    Error::store_unavailable(format!("GCS {} '{}' failed: {}", action, key, err))
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match self
            .client
            .download_object(&self.get_request(key), &Range::default())
            .await
        {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(unavailable("download", key, e)),
        }
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        match self.client.get_object(&self.get_request(key)).await {
            Ok(object) => {
                let pairs: BTreeMap<String, String> =
                    object.metadata.unwrap_or_default().into_iter().collect();
                Ok(Some(ObjectMetadata::from_pairs(object.content_type, pairs)))
            }
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(unavailable("stat", key, e)),
        }
    }

    async fn put(&self, key: &str, data: Bytes, metadata: &ObjectMetadata) -> Result<()> {
        let custom: HashMap<String, String> = metadata.to_pairs().into_iter().collect();
        let object = Object {
            name: key.to_string(),
            content_type: metadata.content_type.clone(),
            metadata: if custom.is_empty() { None } else { Some(custom) },
            ..Default::default()
        };

        // Single-request uploads are atomic from a reader's point of view
        self.client
            .upload_object(
                &UploadObjectRequest {
                    bucket: self.bucket.clone(),
                    ..Default::default()
                },
                data.to_vec(),
                &UploadType::Multipart(Box::new(object)),
            )
            .await
            .map_err(|e| unavailable("upload", key, e))?;

        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self.client.get_object(&self.get_request(key)).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(unavailable("stat", key, e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self
            .client
            .delete_object(&DeleteObjectRequest {
                bucket: self.bucket.clone(),
                object: key.to_string(),
                ..Default::default()
            })
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(unavailable("delete", key, e)),
        }
    }

    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<&str>,
        limit: usize,
    ) -> Result<ListPage> {
        let list_request = ListObjectsRequest {
            bucket: self.bucket.clone(),
            prefix: Some(prefix.to_string()),
            page_token: continuation.map(str::to_string),
            max_results: Some(limit.clamp(1, 1000) as i32),
            ..Default::default()
        };

        let response = self
            .client
            .list_objects(&list_request)
            .await
            .map_err(|e| unavailable("list", prefix, e))?;

        let mut keys: Vec<String> = response
            .items
            .unwrap_or_default()
            .into_iter()
            .map(|item| item.name)
            .collect();
        keys.sort();

        Ok(ListPage {
            keys,
            next: response.next_page_token,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        // Try to list objects (with limit 1) to check bucket access
        let list_request = ListObjectsRequest {
            bucket: self.bucket.clone(),
            max_results: Some(1),
            ..Default::default()
        };

        self.client
            .list_objects(&list_request)
            .await
            .map(|_| true)
            .map_err(|e| Error::store_unavailable(format!("GCS health check failed: {}", e)))
    }

    fn name(&self) -> &str {
        "gcs"
    }
}
