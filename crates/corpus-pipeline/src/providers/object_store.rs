//! Object store provider trait for stage objects

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Sidecar metadata stored next to an object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Provenance identifier of the document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl ObjectMetadata {
    pub fn with_content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            ..Default::default()
        }
    }

    /// Flatten into string pairs (for stores with string-only metadata)
    pub fn to_pairs(&self) -> BTreeMap<String, String> {
        let mut pairs = self.extra.clone();
        if let Some(identifier) = &self.identifier {
            pairs.insert("identifier".to_string(), identifier.clone());
        }
        if let Some(title) = &self.title {
            pairs.insert("title".to_string(), title.clone());
        }
        if let Some(captured_at) = &self.captured_at {
            pairs.insert("captured_at".to_string(), captured_at.to_rfc3339());
        }
        pairs
    }

    /// Inverse of [`ObjectMetadata::to_pairs`]
    pub fn from_pairs(content_type: Option<String>, mut pairs: BTreeMap<String, String>) -> Self {
        let identifier = pairs.remove("identifier");
        let title = pairs.remove("title");
        let captured_at = pairs
            .remove("captured_at")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        Self {
            content_type,
            identifier,
            title,
            captured_at,
            extra: pairs,
        }
    }
}

/// One page of a key listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Keys in lexicographic order
    pub keys: Vec<String>,
    /// Continuation token for the next page; `None` when the listing is complete
    pub next: Option<String>,
}

/// Trait for stage object storage
///
/// Implementations:
/// - `LocalObjectStore`: Local filesystem
/// - `MemoryObjectStore`: In-process map
/// - `GcsObjectStore`: Google Cloud Storage
///
/// Not-found is never an error: `get` returns `None` and `exists` returns
/// `false`. Connectivity failures surface as `Error::StoreUnavailable`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object's bytes
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Fetch an object's sidecar metadata
    async fn get_metadata(&self, key: &str) -> Result<Option<ObjectMetadata>>;

    /// Write an object; readers observe either the old or the new bytes
    async fn put(&self, key: &str, data: Bytes, metadata: &ObjectMetadata) -> Result<()>;

    /// Check whether an object exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete an object (no-op when missing)
    async fn delete(&self, key: &str) -> Result<()>;

    /// List up to `limit` keys under `prefix`, resuming after `continuation`
    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<&str>,
        limit: usize,
    ) -> Result<ListPage>;

    /// Check if the provider is healthy
    async fn health_check(&self) -> Result<bool>;

    /// Get provider name for logging
    fn name(&self) -> &str;
}

enum ListState {
    Start,
    Continue(String),
    Done,
}

/// Lazily list every key under `prefix`, one page at a time
pub fn list_keys(
    store: Arc<dyn ObjectStore>,
    prefix: String,
    page_size: usize,
) -> BoxStream<'static, Result<String>> {
    let page_size = page_size.max(1);
    stream::try_unfold(ListState::Start, move |state| {
        let store = store.clone();
        let prefix = prefix.clone();
        async move {
            let continuation = match state {
                ListState::Done => return Ok::<_, Error>(None),
                ListState::Start => None,
                ListState::Continue(token) => Some(token),
            };
            let page = store
                .list_page(&prefix, continuation.as_deref(), page_size)
                .await?;
            let next_state = match page.next {
                Some(token) => ListState::Continue(token),
                None => ListState::Done,
            };
            Ok::<_, Error>(Some((page.keys, next_state)))
        }
    })
    .map_ok(|keys| stream::iter(keys.into_iter().map(Ok::<String, Error>)))
    .try_flatten()
    .boxed()
}

/// Collect a full listing into memory
pub async fn list_all(
    store: Arc<dyn ObjectStore>,
    prefix: &str,
    page_size: usize,
) -> Result<Vec<String>> {
    list_keys(store, prefix.to_string(), page_size)
        .try_collect()
        .await
}

/// Paginate a sorted key list the way the in-process stores do
pub(crate) fn page_from_sorted<'a>(
    keys: impl Iterator<Item = &'a String>,
    prefix: &str,
    continuation: Option<&str>,
    limit: usize,
) -> ListPage {
    let limit = limit.max(1);
    let mut selected: Vec<String> = keys
        .filter(|k| k.starts_with(prefix))
        .filter(|k| continuation.map_or(true, |c| k.as_str() > c))
        .take(limit + 1)
        .cloned()
        .collect();

    let next = if selected.len() > limit {
        selected.truncate(limit);
        selected.last().cloned()
    } else {
        None
    };

    ListPage { keys: selected, next }
}
