//! Parser dispatch
//!
//! Turns one raw stage-1 payload into zero or more parsed documents. Archives
//! fan out into one document per member; every other type yields exactly
//! one. A failing archive member becomes a failed document of its own so the
//! rest of the archive still goes through.

use futures::future::{BoxFuture, FutureExt};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::error::{Error, Result};
use crate::ingestion::archive::read_entries;
use crate::ingestion::detect::{is_uuencode_header, MediaType};
use crate::ingestion::external_parser::{
    ConversionBackend, Extraction, HttpConversionBackend, OcrBackend, TesseractOcr,
};
use crate::ingestion::html::html_to_markdown;
use crate::ingestion::pdf::PdfExtractor;
use crate::ingestion::wrappers::{strip_pdf_wrapper, strip_xml_wrapper, uudecode};
use crate::ingestion::xml::parse_xml;
use crate::types::ParsedDocument;

/// One payload to parse
#[derive(Debug, Clone)]
pub struct ParseInput {
    pub source: String,
    pub identifier: String,
    /// Stage-1 key the payload came from
    pub original_uri: Option<String>,
    /// Declared content type, if any
    pub format: Option<String>,
    pub data: Vec<u8>,
}

/// Routes payloads to the parser for their media type
pub struct ParserDispatch {
    pdf: PdfExtractor,
    conversion: Option<Arc<dyn ConversionBackend>>,
    max_size: usize,
    max_archive_depth: usize,
}

impl ParserDispatch {
    pub fn new(
        config: &PipelineConfig,
        conversion: Option<Arc<dyn ConversionBackend>>,
        ocr: Option<Arc<dyn OcrBackend>>,
    ) -> Self {
        Self {
            pdf: PdfExtractor::new(&config.parser, conversion.clone(), ocr),
            conversion,
            max_size: config.processing.max_size,
            max_archive_depth: config.parser.max_archive_depth,
        }
    }

    /// Build with the backends enabled in `config`
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let conversion: Option<Arc<dyn ConversionBackend>> = if config.parser.conversion.enabled {
            tracing::info!("Conversion service enabled: {}", config.parser.conversion.url);
            Some(Arc::new(HttpConversionBackend::new(&config.parser.conversion)?))
        } else {
            None
        };
        let ocr: Option<Arc<dyn OcrBackend>> = if config.parser.ocr.enabled {
            Some(Arc::new(TesseractOcr::new(&config.parser.ocr)))
        } else {
            None
        };
        Ok(Self::new(config, conversion, ocr))
    }

    /// Parse a payload; an error means the payload as a whole failed
    pub async fn parse(&self, input: ParseInput) -> Result<Vec<ParsedDocument>> {
        self.parse_at_depth(input, 0).await
    }

    fn parse_at_depth(&self, input: ParseInput, depth: usize) -> BoxFuture<'_, Result<Vec<ParsedDocument>>> {
        async move {
            if input.data.len() > self.max_size {
                return Err(Error::SizeExceeded {
                    size: input.data.len(),
                    limit: self.max_size,
                });
            }

            let mut input = input;
            if let Some(inner) = strip_pdf_wrapper(&input.data) {
                input.data = inner.to_vec();
                input.format = None;
            }

            let mut media = MediaType::detect(input.format.as_deref(), &input.data);
            if media == MediaType::PlainText {
                media = refine_plain_text(&input.data);
            }
            tracing::debug!("[{}] detected {}", input.identifier, media);

            match media {
                MediaType::Archive => self.parse_archive(input, depth).await,
                MediaType::Uuencoded => {
                    let decoded = uudecode(&input.data)?;
                    tracing::debug!(
                        "[{}] uudecoded {} ({} bytes)",
                        input.identifier,
                        decoded.name,
                        decoded.data.len()
                    );
                    let format = MediaType::from_filename(&decoded.name).map(|m| m.mime().to_string());
                    let name = decoded.name;
                    let mut docs = self
                        .parse_at_depth(
                            ParseInput {
                                format,
                                data: decoded.data,
                                ..input
                            },
                            depth,
                        )
                        .await?;
                    for doc in &mut docs {
                        doc.set_metadata("embedded_filename", name.clone());
                    }
                    Ok(docs)
                }
                media => self.parse_single(input, media).await.map(|doc| vec![doc]),
            }
        }
        .boxed()
    }

    async fn parse_single(&self, input: ParseInput, media: MediaType) -> Result<ParsedDocument> {
        let mut doc = ParsedDocument::new(&input.source, &input.identifier)
            .with_original_uri(input.original_uri.as_deref());
        doc.set_metadata("content_hash", hex::encode(Sha256::digest(&input.data)));
        doc.set_metadata("media_type", media.mime());

        match media {
            MediaType::Html => {
                let data = input.data;
                let page =
                    tokio::task::spawn_blocking(move || html_to_markdown(&String::from_utf8_lossy(&data)))
                        .await?;
                if let Some(title) = page.title {
                    doc.set_metadata("title", title);
                }
                doc.add_representation("text/markdown", page.markdown);
            }
            MediaType::Xml => {
                let identifier = input.identifier.clone();
                let data = input.data;
                let parsed = tokio::task::spawn_blocking(move || {
                    let text = String::from_utf8_lossy(&data);
                    parse_xml(&identifier, strip_xml_wrapper(&text))
                })
                .await??;
                doc.add_representation("application/xml", parsed.pretty);
                doc.add_representation("application/json", serde_json::to_string_pretty(&parsed.tree)?);
            }
            MediaType::Json => {
                let value: serde_json::Value = serde_json::from_slice(&input.data).map_err(|e| {
                    Error::extraction_failed(&input.identifier, format!("invalid JSON: {}", e))
                })?;
                doc.add_representation("application/json", serde_json::to_string_pretty(&value)?);
            }
            MediaType::Markdown => {
                doc.add_representation("text/markdown", String::from_utf8_lossy(&input.data));
            }
            MediaType::PlainText => {
                doc.add_representation("text/plain", String::from_utf8_lossy(&input.data));
            }
            MediaType::Pdf => {
                let extraction = self.pdf.extract(&input.identifier, &input.data).await?;
                doc.set_metadata("extraction_method", extraction.method.as_str());
                doc.set_metadata("pdf_kind", extraction.kind.as_str());
                doc.set_metadata("parser_attempts", serde_json::to_value(&extraction.attempts)?);
                doc.add_representation("text/plain", extraction.text);
            }
            MediaType::Other(mime) => {
                let backend = self.conversion.as_ref().ok_or_else(|| {
                    Error::UnsupportedFormat(format!("{} (no conversion service configured)", mime))
                })?;
                match backend.convert(&input.data, &mime).await? {
                    Extraction::Text(text) => {
                        doc.set_metadata("extraction_method", backend.name());
                        doc.add_representation("text/plain", text);
                    }
                    Extraction::NoText => {
                        return Err(Error::extraction_failed(
                            &input.identifier,
                            format!("conversion service found no text in {}", mime),
                        ));
                    }
                }
            }
            MediaType::Unsupported(reason) => return Err(Error::UnsupportedFormat(reason)),
            MediaType::Archive | MediaType::Uuencoded => {
                return Err(Error::internal(format!("{} reached single-document parsing", media)));
            }
        }

        Ok(doc)
    }

    async fn parse_archive(&self, input: ParseInput, depth: usize) -> Result<Vec<ParsedDocument>> {
        if depth >= self.max_archive_depth {
            return Err(Error::UnsupportedFormat(format!(
                "archive nested deeper than {} level(s)",
                self.max_archive_depth
            )));
        }

        let max_size = self.max_size;
        let data = input.data;
        let entries = tokio::task::spawn_blocking(move || read_entries(&data, max_size)).await??;
        tracing::debug!("[{}] archive with {} members", input.identifier, entries.len());

        let mut docs = Vec::new();
        for entry in entries {
            let identifier = format!("{}/{}", input.identifier, entry.name);
            let child = ParseInput {
                source: input.source.clone(),
                identifier: identifier.clone(),
                original_uri: input.original_uri.clone(),
                format: MediaType::from_filename(&entry.name).map(|m| m.mime().to_string()),
                data: entry.data,
            };

            match self.parse_at_depth(child, depth + 1).await {
                Ok(parsed) => docs.extend(parsed),
                Err(e) => {
                    tracing::warn!("[{}] archive member failed: {}", identifier, e);
                    docs.push(
                        ParsedDocument::failed(&input.source, identifier, Some(e.kind()), e.to_string())
                            .with_original_uri(input.original_uri.as_deref()),
                    );
                }
            }
        }

        Ok(docs)
    }
}

/// Plain text that is really HTML or a uuencoded attachment
fn refine_plain_text(data: &[u8]) -> MediaType {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    if is_uuencode_header(&data[start..]) {
        return MediaType::Uuencoded;
    }

    let head = &data[..data.len().min(64 * 1024)];
    let lowered = String::from_utf8_lossy(head).to_ascii_lowercase();
    if lowered.contains("<html") || lowered.contains("<!doctype") {
        MediaType::Html
    } else {
        MediaType::PlainText
    }
}
