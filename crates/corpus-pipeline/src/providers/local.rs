//! Local object store using the filesystem
//!
//! Objects live at `{root}/{key}.obj`; sidecar metadata lives under
//! `{root}/.meta/{key}.json` so it never shows up in listings. The leaf
//! suffix lets `x/a` and `x/a/b` coexist: one is the file `x/a.obj`, the
//! other sits under the directory `x/a/`.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::ffi::OsStr;
use std::io::Write;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{Error, Result};

use super::object_store::{ListPage, ObjectMetadata, ObjectStore};

const META_DIR: &str = ".meta";
const OBJECT_SUFFIX: &str = ".obj";

/// Open listings kept between pages; older ones are dropped past this
const MAX_CURSORS: usize = 16;

/// Local object store rooted at a directory
///
/// A listing walks the directory tree once; later pages are served from the
/// sorted snapshot taken by the first call, keyed on the continuation token.
pub struct LocalObjectStore {
    root: PathBuf,
    cursors: Mutex<HashMap<(String, String), VecDeque<String>>>,
}

impl LocalObjectStore {
    /// Create a new local object store
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            cursors: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Hand out one page and park the rest under the next continuation token
    fn serve_page(&self, prefix: &str, mut remaining: VecDeque<String>, limit: usize) -> ListPage {
        let take = limit.min(remaining.len());
        let keys: Vec<String> = remaining.drain(..take).collect();
        if remaining.is_empty() {
            return ListPage { keys, next: None };
        }

        let next = keys.last().cloned();
        if let Some(token) = &next {
            let mut cursors = self.cursors.lock();
            if cursors.len() >= MAX_CURSORS {
                cursors.clear();
            }
            cursors.insert((prefix.to_string(), token.clone()), remaining);
        }
        ListPage { keys, next }
    }

    /// Get path for an object
    fn object_path(&self, key: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join(format!("{}{}", checked_key(key)?, OBJECT_SUFFIX)))
    }

    /// Get metadata path for an object
    fn meta_path(&self, key: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join(META_DIR)
            .join(format!("{}.json", checked_key(key)?)))
    }
}

/// Keys must stay inside the root
fn checked_key(key: &str) -> Result<&str> {
    if key.is_empty() || key.starts_with('/') || key.contains('\\') {
        return Err(Error::invalid_key(key, "not a relative object key"));
    }
    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == ".." || segment == META_DIR)
    {
        return Err(Error::invalid_key(key, "invalid path segment"));
    }
    Ok(key)
}

/// Write `data` to a temporary file beside `path`, then rename it into place
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::internal(format!("No parent directory for {}", path.display())))?;
    std::fs::create_dir_all(parent)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(parent)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Every key under `prefix` sorted, skipping sidecars and in-flight temp files
fn walk_sorted(root: &Path, prefix: &str, after: Option<&str>) -> Result<Vec<String>> {
    // Only walk the deepest directory the prefix pins down
    let base = match prefix.rfind('/') {
        Some(idx) => root.join(&prefix[..idx]),
        None => root.to_path_buf(),
    };
    if !base.exists() {
        return Ok(Vec::new());
    }

    let mut keys = Vec::new();
    let walker = WalkDir::new(&base)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !(e.path().parent() == Some(root) && e.file_name() == OsStr::new(META_DIR)));
    for entry in walker {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if !entry.file_type().is_file() || entry.file_name().to_string_lossy().starts_with(".tmp-") {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let path = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let Some(key) = path.strip_suffix(OBJECT_SUFFIX) else {
            continue;
        };
        if key.starts_with(prefix) && after.map_or(true, |a| key > a) {
            keys.push(key.to_string());
        }
    }
    keys.sort_unstable();
    Ok(keys)
}

async fn read_optional(path: PathBuf) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(&path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Io(e)),
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.object_path(key)?;
        Ok(read_optional(path).await?.map(Bytes::from))
    }

    async fn get_metadata(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        if !self.exists(key).await? {
            return Ok(None);
        }
        match read_optional(self.meta_path(key)?).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(Some(ObjectMetadata::default())),
        }
    }

    async fn put(&self, key: &str, data: Bytes, metadata: &ObjectMetadata) -> Result<()> {
        let doc_path = self.object_path(key)?;
        let meta_path = self.meta_path(key)?;
        let meta_json = serde_json::to_vec_pretty(metadata)?;

        // Sidecar first so a visible object always has its metadata
        tokio::task::spawn_blocking(move || {
            write_atomic(&meta_path, &meta_json)?;
            write_atomic(&doc_path, &data)
        })
        .await?
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.object_path(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        for path in [self.object_path(key)?, self.meta_path(key)?] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<&str>,
        limit: usize,
    ) -> Result<ListPage> {
        let limit = limit.max(1);
        if let Some(token) = continuation {
            let cached = self
                .cursors
                .lock()
                .remove(&(prefix.to_string(), token.to_string()));
            if let Some(remaining) = cached {
                return Ok(self.serve_page(prefix, remaining, limit));
            }
        }

        let root = self.root.clone();
        let owned_prefix = prefix.to_string();
        let after = continuation.map(str::to_string);
        let keys = tokio::task::spawn_blocking(move || {
            walk_sorted(&root, &owned_prefix, after.as_deref())
        })
        .await??;

        Ok(self.serve_page(prefix, keys.into(), limit))
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.root.exists())
    }

    fn name(&self) -> &str {
        "local-filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::object_store::list_all;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_put_get_with_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path()).unwrap();

        let mut meta = ObjectMetadata::with_content_type("application/json");
        meta.identifier = Some("https://example.gov/doc".to_string());
        store
            .put("documents/ds/a/b.json", Bytes::from_static(b"{\"x\":1}"), &meta)
            .await
            .unwrap();

        assert!(store.exists("documents/ds/a/b.json").await.unwrap());
        assert_eq!(
            store.get("documents/ds/a/b.json").await.unwrap().unwrap(),
            Bytes::from_static(b"{\"x\":1}")
        );
        assert_eq!(store.get_metadata("documents/ds/a/b.json").await.unwrap(), Some(meta));
        assert_eq!(store.get("documents/ds/missing.json").await.unwrap(), None);
        assert!(!store.exists("documents/ds/missing.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_overwrite_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path()).unwrap();
        let meta = ObjectMetadata::default();

        store.put("parquet/ds/x", Bytes::from_static(b"old"), &meta).await.unwrap();
        store.put("parquet/ds/x", Bytes::from_static(b"new"), &meta).await.unwrap();
        assert_eq!(store.get("parquet/ds/x").await.unwrap().unwrap(), Bytes::from_static(b"new"));

        store.delete("parquet/ds/x").await.unwrap();
        store.delete("parquet/ds/x").await.unwrap();
        assert!(!store.exists("parquet/ds/x").await.unwrap());
    }

    #[tokio::test]
    async fn test_listing_skips_sidecars_and_respects_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalObjectStore::new(dir.path()).unwrap());
        let meta = ObjectMetadata::with_content_type("application/json");

        for key in [
            "documents/ds/2024/a.json",
            "documents/ds/2024/b.json",
            "documents/ds/2025/c.json",
            "documents/other/d.json",
        ] {
            store.put(key, Bytes::from_static(b"{}"), &meta).await.unwrap();
        }

        let all = list_all(store.clone(), "documents/ds/", 2).await.unwrap();
        assert_eq!(
            all,
            vec![
                "documents/ds/2024/a.json",
                "documents/ds/2024/b.json",
                "documents/ds/2025/c.json"
            ]
        );

        let sub = list_all(store.clone(), "documents/ds/2024/", 10).await.unwrap();
        assert_eq!(sub.len(), 2);

        let none = list_all(store, "representations/ds/", 10).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_key_may_also_be_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalObjectStore::new(dir.path()).unwrap());
        let meta = ObjectMetadata::default();

        // columnar keys of documents `x/a.json` and `x/a/b.json`
        store.put("parquet/ds/x/a", Bytes::from_static(b"one"), &meta).await.unwrap();
        store.put("parquet/ds/x/a/b", Bytes::from_static(b"two"), &meta).await.unwrap();

        assert_eq!(store.get("parquet/ds/x/a").await.unwrap().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(store.get("parquet/ds/x/a/b").await.unwrap().unwrap(), Bytes::from_static(b"two"));
        assert_eq!(
            list_all(store, "parquet/ds/", 10).await.unwrap(),
            vec!["parquet/ds/x/a", "parquet/ds/x/a/b"]
        );
    }

    #[tokio::test]
    async fn test_paged_listing_walks_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path()).unwrap();
        let meta = ObjectMetadata::default();
        let mut expected = Vec::new();
        for d in ["a", "a-b", "b"] {
            for i in 0..3 {
                let key = format!("parquet/ds/{}/{}", d, i);
                store.put(&key, Bytes::from_static(b"x"), &meta).await.unwrap();
                expected.push(key);
            }
        }
        expected.sort();

        let first = store.list_page("parquet/ds/", None, 4).await.unwrap();
        assert_eq!(first.keys, expected[..4]);
        let token = first.next.clone().unwrap();

        // later pages come from the first walk's snapshot
        store.put("parquet/ds/a/00", Bytes::from_static(b"x"), &meta).await.unwrap();
        let second = store.list_page("parquet/ds/", Some(&token), 4).await.unwrap();
        assert_eq!(second.keys, expected[4..8]);

        // a token the store has never handed out falls back to a fresh walk
        let fresh = LocalObjectStore::new(dir.path()).unwrap();
        let resumed = fresh.list_page("parquet/ds/", Some(&token), 100).await.unwrap();
        assert_eq!(token, "parquet/ds/a/0");
        assert_eq!(resumed.keys[0], "parquet/ds/a/00");
        assert_eq!(resumed.keys[1..], expected[4..]);
        assert_eq!(resumed.next, None);

        let third = store
            .list_page("parquet/ds/", second.next.as_deref(), 4)
            .await
            .unwrap();
        assert_eq!(third.keys, expected[8..]);
        assert_eq!(third.next, None);
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path()).unwrap();
        for key in ["../escape", "/abs", "a//b", ".meta/x"] {
            assert!(matches!(store.get(key).await, Err(Error::InvalidKey { .. })));
        }
    }
}
