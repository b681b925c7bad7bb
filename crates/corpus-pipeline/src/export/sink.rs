//! Export destinations
//!
//! Both sinks receive the same filtered record sequence in batches:
//! - [`JsonlGzSink`]: one gzip-compressed JSON Lines file
//! - [`HostSink`]: uploads each batch through a [`DatasetHost`]

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

use super::record::ExportRecord;

/// Receives filtered records batch by batch
#[async_trait]
pub trait RecordSink: Send {
    async fn write_batch(&mut self, records: &[ExportRecord]) -> Result<()>;

    /// Flush and close; no batches follow
    async fn finish(&mut self) -> Result<()>;
}

/// Remote dataset repository accepting record uploads
#[async_trait]
pub trait DatasetHost: Send + Sync {
    /// Upload one batch of records to `destination`
    async fn upload_batch(&self, destination: &str, records: &[ExportRecord]) -> Result<()>;

    /// Get host name for logging
    fn name(&self) -> &str;
}

fn encode_jsonl(records: &[ExportRecord], out: &mut impl Write) -> Result<()> {
    for record in records {
        serde_json::to_writer(&mut *out, record)?;
        out.write_all(b"\n")?;
    }
    Ok(())
}

/// gzip JSON Lines file, one record per line
pub struct JsonlGzSink {
    path: PathBuf,
    writer: Option<GzEncoder<BufWriter<File>>>,
}

impl JsonlGzSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        Ok(Self {
            path,
            writer: Some(GzEncoder::new(BufWriter::new(file), Compression::default())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordSink for JsonlGzSink {
    async fn write_batch(&mut self, records: &[ExportRecord]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::internal(format!("{} already finished", self.path.display())))?;
        encode_jsonl(records, writer)
    }

    async fn finish(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finish()?.flush()?;
        }
        Ok(())
    }
}

/// Forwards batches to a dataset host
pub struct HostSink {
    host: Arc<dyn DatasetHost>,
    destination: String,
}

impl HostSink {
    pub fn new(host: Arc<dyn DatasetHost>, destination: impl Into<String>) -> Self {
        Self {
            host,
            destination: destination.into(),
        }
    }
}

#[async_trait]
impl RecordSink for HostSink {
    async fn write_batch(&mut self, records: &[ExportRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            "Uploading {} records to {} ({})",
            records.len(),
            self.destination,
            self.host.name()
        );
        self.host.upload_batch(&self.destination, records).await
    }

    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Dataset host backed by a local directory
///
/// Each batch becomes `{root}/{destination}/shard-{n:05}.jsonl.gz`.
pub struct LocalDatasetHost {
    root: PathBuf,
    next_shard: AtomicUsize,
}

impl LocalDatasetHost {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            next_shard: AtomicUsize::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl DatasetHost for LocalDatasetHost {
    async fn upload_batch(&self, destination: &str, records: &[ExportRecord]) -> Result<()> {
        if destination.split('/').any(|s| s == ".." || s == ".") || destination.starts_with('/') {
            return Err(Error::Config(format!("Invalid export destination: {}", destination)));
        }

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encode_jsonl(records, &mut encoder)?;
        let data = encoder.finish()?;

        let shard = self.next_shard.fetch_add(1, Ordering::SeqCst);
        let dir = self.root.join(destination);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("shard-{:05}.jsonl.gz", shard));
        tokio::fs::write(&path, data).await?;

        tracing::debug!("Wrote {} records to {}", records.len(), path.display());
        Ok(())
    }

    fn name(&self) -> &str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn record(identifier: &str) -> ExportRecord {
        ExportRecord::new(identifier, "edgar", "text/plain", vec![1, 2])
    }

    fn gunzip_lines(path: &Path) -> Vec<String> {
        let mut text = String::new();
        GzDecoder::new(File::open(path).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        text.lines().map(str::to_string).collect()
    }

    #[tokio::test]
    async fn test_jsonl_gz_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/export.jsonl.gz");
        let mut sink = JsonlGzSink::create(&path).unwrap();
        sink.write_batch(&[record("a"), record("b")]).await.unwrap();
        sink.write_batch(&[record("c")]).await.unwrap();
        sink.finish().await.unwrap();

        let lines = gunzip_lines(&path);
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            r#"{"identifier":"a","dataset":"edgar","mime_type":"text/plain","tokens":[1,2]}"#
        );
        assert!(sink.write_batch(&[record("d")]).await.is_err());
    }

    #[tokio::test]
    async fn test_text_records_omit_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("text.jsonl.gz");
        let mut text = ExportRecord::new("a", "edgar", "text/plain", Vec::new());
        text.text = Some("Item 1. Business".to_string());
        text.score = Some(0.5);

        let mut sink = JsonlGzSink::create(&path).unwrap();
        sink.write_batch(&[text]).await.unwrap();
        sink.finish().await.unwrap();

        assert_eq!(
            gunzip_lines(&path),
            vec![r#"{"identifier":"a","dataset":"edgar","mime_type":"text/plain","text":"Item 1. Business","score":0.5}"#]
        );
    }

    #[tokio::test]
    async fn test_local_host_writes_shards() {
        let dir = tempfile::tempdir().unwrap();
        let host = LocalDatasetHost::new(dir.path()).unwrap();
        host.upload_batch("org/edgar", &[record("a"), record("b")]).await.unwrap();
        host.upload_batch("org/edgar", &[record("c")]).await.unwrap();

        let first = dir.path().join("org/edgar/shard-00000.jsonl.gz");
        let second = dir.path().join("org/edgar/shard-00001.jsonl.gz");
        assert_eq!(gunzip_lines(&first).len(), 2);
        assert_eq!(gunzip_lines(&second).len(), 1);

        assert!(host.upload_batch("../escape", &[record("x")]).await.is_err());
    }
}
