//! Shared test doubles and fixtures

use async_trait::async_trait;
use bytes::Bytes;
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::{PipelineConfig, RepresentationConfig};
use crate::error::{Error, Result};
use crate::ingestion::{ConversionBackend, Extraction, OcrBackend, ParserDispatch};
use crate::pipeline::StageTransformer;
use crate::providers::{MemoryObjectStore, ObjectMetadata, ObjectStore};
use crate::representation::{FilterChain, RepresentationBuilder, TokenEncoder};
use crate::storage::ParquetEncoder;
use crate::types::SourceDocument;

/// One token per whitespace-separated word; the id is the word's length
pub struct FakeTokenizer {
    name: String,
}

impl FakeTokenizer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl TokenEncoder for FakeTokenizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text
            .split_whitespace()
            .map(|w| w.chars().count() as u32)
            .collect())
    }

    /// Each id becomes a word of that many `w`s
    fn decode(&self, ids: &[u32]) -> Result<String> {
        Ok(ids
            .iter()
            .map(|&id| "w".repeat(id as usize))
            .collect::<Vec<_>>()
            .join(" "))
    }
}

/// Rejects every input
pub struct FailingTokenizer;

impl TokenEncoder for FailingTokenizer {
    fn name(&self) -> &str {
        "failing"
    }

    fn encode(&self, _text: &str) -> Result<Vec<u32>> {
        Err(Error::tokenize_failed("failing", "always fails"))
    }

    fn decode(&self, _ids: &[u32]) -> Result<String> {
        Err(Error::tokenize_failed("failing", "always fails"))
    }
}

/// Conversion service returning a canned result
pub struct StubConversion {
    result: Extraction,
    calls: AtomicUsize,
}

impl StubConversion {
    pub fn no_text() -> Self {
        Self {
            result: Extraction::NoText,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_text(text: &str) -> Self {
        Self {
            result: Extraction::Text(text.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConversionBackend for StubConversion {
    async fn convert(&self, _data: &[u8], _media_type: &str) -> Result<Extraction> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.result.clone())
    }

    fn name(&self) -> &str {
        "conversion"
    }
}

/// OCR engine returning a canned result
pub struct StubOcr {
    result: Extraction,
    calls: AtomicUsize,
}

impl StubOcr {
    pub fn no_text() -> Self {
        Self {
            result: Extraction::NoText,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_text(text: &str) -> Self {
        Self {
            result: Extraction::Text(text.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrBackend for StubOcr {
    async fn recognize(&self, _pdf: &[u8], _max_pages: u32) -> Result<Extraction> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.result.clone())
    }

    fn name(&self) -> &str {
        "ocr"
    }
}

/// A scanned-looking PDF: image XObjects and no text operators
pub fn image_only_pdf() -> Vec<u8> {
    let mut pdf = b"%PDF-1.4\n".to_vec();
    pdf.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
    pdf.extend_from_slice(b"2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n");
    pdf.extend_from_slice(b"3 0 obj << /Type /Page /Parent 2 0 R /Resources << /XObject << /Im0 4 0 R >> >> >> endobj\n");
    pdf.extend_from_slice(b"4 0 obj << /Type /XObject /Subtype /Image /Width 8 /Height 8 /BitsPerComponent 8 >> endobj\n");
    pdf.extend_from_slice(b"trailer << /Root 1 0 R >>\n%%EOF\n");
    pdf
}

/// Zip archive with the given members; names ending in `/` become directories
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, data) in entries {
        if name.ends_with('/') {
            writer.add_directory(*name, options).unwrap();
        } else {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
    }
    writer.finish().unwrap().into_inner()
}

/// Write a stage-1 envelope to `documents/{dataset}/{path}`
pub async fn put_source(
    store: &MemoryObjectStore,
    dataset: &str,
    path: &str,
    format: Option<&str>,
    content: &[u8],
) {
    let source = SourceDocument::new(format!("https://example.test/{}", path), format, content.to_vec())
        .with_source("test");
    let body = serde_json::to_vec(&source).unwrap();
    store
        .put(
            &format!("documents/{}/{}", dataset, path),
            Bytes::from(body),
            &ObjectMetadata::with_content_type("application/json"),
        )
        .await
        .unwrap();
}

/// Transformer with no external backends and a word-length tokenizer named `words`
pub fn test_transformer() -> StageTransformer {
    let config = PipelineConfig::default();
    StageTransformer::new(
        ParserDispatch::new(&config, None, None),
        RepresentationBuilder::new(
            FilterChain::from_config(&RepresentationConfig::default()).unwrap(),
            vec![Arc::new(FakeTokenizer::new("words"))],
        ),
        Arc::new(ParquetEncoder),
    )
}
