//! In-process object store

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

use super::object_store::{page_from_sorted, ListPage, ObjectMetadata, ObjectStore};

/// Object store backed by a sorted in-memory map
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, (Bytes, ObjectMetadata)>>,
    online: AtomicBool,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            online: AtomicBool::new(true),
        }
    }

    /// Simulate losing (or regaining) connectivity
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn check_online(&self) -> Result<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::store_unavailable("memory store is offline"))
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.check_online()?;
        Ok(self.objects.read().get(key).map(|(data, _)| data.clone()))
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        self.check_online()?;
        Ok(self.objects.read().get(key).map(|(_, meta)| meta.clone()))
    }

    async fn put(&self, key: &str, data: Bytes, metadata: &ObjectMetadata) -> Result<()> {
        self.check_online()?;
        self.objects
            .write()
            .insert(key.to_string(), (data, metadata.clone()));
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_online()?;
        Ok(self.objects.read().contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_online()?;
        self.objects.write().remove(key);
        Ok(())
    }

    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<&str>,
        limit: usize,
    ) -> Result<ListPage> {
        self.check_online()?;
        let objects = self.objects.read();
        let start = match continuation {
            Some(token) if token >= prefix => Bound::Excluded(token),
            _ => Bound::Included(prefix),
        };
        let keys = objects
            .range::<str, _>((start, Bound::Unbounded))
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(prefix));
        Ok(page_from_sorted(keys, prefix, continuation, limit))
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.online.load(Ordering::SeqCst))
    }

    fn name(&self) -> &str {
        "memory"
    }
}
