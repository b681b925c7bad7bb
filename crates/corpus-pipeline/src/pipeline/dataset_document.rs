//! One document tracked across stages
//!
//! `DatasetDocument` binds a [`DocumentKey`] to a store and knows how to
//! move the document one stage forward. Each advance reads the whole source
//! object, transforms it in memory and commits the result with a single
//! `put`, so a target object is either absent or complete.

use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::ingestion::{ParseInput, ParserDispatch};
use crate::providers::{ObjectMetadata, ObjectStore};
use crate::representation::RepresentationBuilder;
use crate::storage::{ColumnarEncoder, ParquetEncoder};
use crate::types::{ParsedDocument, RepresentationsPayload, SourceDocument};

use super::stage::{stage_key, DocumentKey, Stage};

/// Result of advancing one document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// Target object written
    Written,
    /// Target already present and clobber was off
    SkippedExists,
    /// Nothing worth writing (empty source, or no content survived)
    SkippedEmpty,
    /// The document could not be transformed; nothing was written
    Failed { kind: ErrorKind, detail: String },
}

impl AdvanceOutcome {
    fn failed(kind: ErrorKind, detail: impl Into<String>) -> Self {
        AdvanceOutcome::Failed {
            kind,
            detail: detail.into(),
        }
    }

    fn from_error(e: &Error) -> Self {
        Self::failed(e.kind(), e.to_string())
    }
}

/// What a transformation produced
enum Transformed {
    Payload(Vec<u8>, ObjectMetadata),
    Empty,
    Failed(ErrorKind, String),
}

/// The per-document transformations between stages
///
/// Shared by every job of a run.
pub struct StageTransformer {
    dispatch: ParserDispatch,
    builder: Arc<RepresentationBuilder>,
    columnar: Arc<dyn ColumnarEncoder>,
}

impl StageTransformer {
    pub fn new(
        dispatch: ParserDispatch,
        builder: RepresentationBuilder,
        columnar: Arc<dyn ColumnarEncoder>,
    ) -> Self {
        Self {
            dispatch,
            builder: Arc::new(builder),
            columnar,
        }
    }

    /// Parser backends, filters, tokenizers and the Parquet encoder from `config`
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let dispatch = ParserDispatch::from_config(config)?;
        let builder = RepresentationBuilder::from_config(&config.representation)?;
        tracing::info!(
            "Representation builder ready (tokenizers: {:?})",
            builder.tokenizer_names()
        );
        Ok(Self::new(dispatch, builder, Arc::new(ParquetEncoder)))
    }

    pub fn columnar(&self) -> Arc<dyn ColumnarEncoder> {
        self.columnar.clone()
    }

    /// Stage 1 -> 2: parse, filter and tokenize a source envelope
    async fn to_representations(
        &self,
        source_key: &str,
        data: &[u8],
        size_limit: Option<usize>,
    ) -> Transformed {
        let source: SourceDocument = match serde_json::from_slice(data) {
            Ok(source) => source,
            Err(e) => {
                return Transformed::Failed(
                    ErrorKind::Encoding,
                    format!("invalid source envelope: {}", e),
                )
            }
        };
        if source.content.iter().all(u8::is_ascii_whitespace) {
            tracing::debug!("[{}] Blank content, nothing to parse", source_key);
            return Transformed::Empty;
        }
        if let Some(limit) = size_limit {
            if source.content.len() > limit {
                let e = Error::SizeExceeded {
                    size: source.content.len(),
                    limit,
                };
                return Transformed::Failed(e.kind(), e.to_string());
            }
        }

        let title = source.title.clone();
        let date = source.date.clone();
        let identifier = source.identifier.clone();
        let input = ParseInput {
            source: source.source,
            identifier: source.identifier,
            original_uri: Some(source_key.to_string()),
            format: source.format,
            data: source.content,
        };

        let parsed = match self.dispatch.parse(input).await {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("[{}] Parse failed: {}", source_key, e);
                return Transformed::Failed(e.kind(), e.to_string());
            }
        };
        if parsed.is_empty() {
            return Transformed::Empty;
        }

        let builder = self.builder.clone();
        let finalized = tokio::task::spawn_blocking(move || {
            parsed
                .into_iter()
                .map(|mut doc| {
                    if let Some(title) = &title {
                        doc.metadata
                            .entry("title".to_string())
                            .or_insert_with(|| title.clone().into());
                    }
                    if let Some(date) = &date {
                        doc.set_metadata("date", date.clone());
                    }
                    builder.finalize(doc)
                })
                .collect::<Vec<ParsedDocument>>()
        })
        .await;
        let finalized = match finalized {
            Ok(docs) => docs,
            Err(e) => return Transformed::Failed(ErrorKind::Internal, e.to_string()),
        };

        let (documents, failed): (Vec<_>, Vec<_>) =
            finalized.into_iter().partition(|doc| doc.success);
        for doc in &failed {
            tracing::warn!(
                "[{}] Dropping {}: {}",
                source_key,
                doc.identifier,
                doc.error.as_deref().unwrap_or("failed")
            );
        }

        if documents.is_empty() {
            // Documents that merely filtered down to nothing carry no error kind
            return match failed.iter().find_map(|d| d.error_kind.map(|k| (k, d))) {
                Some((kind, doc)) => Transformed::Failed(
                    kind,
                    doc.error.clone().unwrap_or_else(|| kind.to_string()),
                ),
                None => Transformed::Empty,
            };
        }

        let mut metadata = ObjectMetadata::with_content_type("application/json");
        metadata.identifier = Some(identifier);
        metadata.title = documents[0]
            .metadata
            .get("title")
            .and_then(|t| t.as_str())
            .map(str::to_string);
        metadata.captured_at = Some(Utc::now());
        metadata
            .extra
            .insert("documents".to_string(), documents.len().to_string());

        match serde_json::to_vec(&RepresentationsPayload { documents }) {
            Ok(bytes) => Transformed::Payload(bytes, metadata),
            Err(e) => Transformed::Failed(ErrorKind::Encoding, e.to_string()),
        }
    }

    /// Stage 2 -> 3: encode tokenized representations
    async fn to_columnar(&self, data: &[u8]) -> Transformed {
        let payload: RepresentationsPayload = match serde_json::from_slice(data) {
            Ok(payload) => payload,
            Err(e) => {
                return Transformed::Failed(
                    ErrorKind::Encoding,
                    format!("invalid representations payload: {}", e),
                )
            }
        };
        let identifier = payload.documents.first().map(|d| d.identifier.clone());

        let encoder = self.columnar.clone();
        let encoded =
            tokio::task::spawn_blocking(move || encoder.encode(&payload.documents)).await;

        match encoded {
            Ok(Ok(Some(bytes))) => {
                let mut metadata = ObjectMetadata::with_content_type(self.columnar.content_type());
                metadata.identifier = identifier;
                metadata.captured_at = Some(Utc::now());
                Transformed::Payload(bytes, metadata)
            }
            Ok(Ok(None)) => Transformed::Empty,
            Ok(Err(e)) => Transformed::Failed(e.kind(), e.to_string()),
            Err(e) => Transformed::Failed(ErrorKind::Internal, e.to_string()),
        }
    }
}

/// A document of one dataset, bound to a store
#[derive(Clone)]
pub struct DatasetDocument {
    key: DocumentKey,
    store: Arc<dyn ObjectStore>,
    size_limit: Option<usize>,
}

impl DatasetDocument {
    pub fn new(store: Arc<dyn ObjectStore>, key: DocumentKey) -> Self {
        Self {
            key,
            store,
            size_limit: None,
        }
    }

    /// Bind a key from any document stage
    pub fn from_key(store: Arc<dyn ObjectStore>, key: &str) -> Result<Self> {
        let (_, key) = DocumentKey::from_stage_key(key)?;
        Ok(Self::new(store, key))
    }

    /// Reject source content above `limit` bytes when advancing out of stage 1
    pub fn with_size_limit(mut self, limit: Option<usize>) -> Self {
        self.size_limit = limit;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    /// Full object key in `stage`
    pub fn stage_key(&self, stage: Stage) -> Result<String> {
        stage_key(stage, &self.key)
    }

    /// Whether the document has an object in `stage`
    pub async fn exists_at(&self, stage: Stage) -> Result<bool> {
        self.store.exists(&self.stage_key(stage)?).await
    }

    /// Move the document from `from` to `to`
    ///
    /// Per-document problems come back as [`AdvanceOutcome::Failed`]; `Err`
    /// is reserved for invalid transitions and store failures.
    pub async fn advance(
        &self,
        from: Stage,
        to: Stage,
        clobber: bool,
        transformer: &StageTransformer,
    ) -> Result<AdvanceOutcome> {
        Stage::check_transition(from, to)?;
        let source_key = self.stage_key(from)?;
        let target_key = self.stage_key(to)?;

        if !clobber && self.store.exists(&target_key).await? {
            tracing::debug!("[{}] {} exists, skipping", source_key, target_key);
            return Ok(AdvanceOutcome::SkippedExists);
        }

        let Some(data) = self.store.get(&source_key).await? else {
            let e = Error::NotFound(source_key.clone());
            return Ok(AdvanceOutcome::from_error(&e));
        };

        let transformed = match from {
            Stage::Documents => {
                transformer
                    .to_representations(&source_key, &data, self.size_limit)
                    .await
            }
            _ => transformer.to_columnar(&data).await,
        };

        match transformed {
            Transformed::Payload(bytes, metadata) => {
                self.store
                    .put(&target_key, Bytes::from(bytes), &metadata)
                    .await?;
                tracing::debug!("[{}] wrote {}", source_key, target_key);
                Ok(AdvanceOutcome::Written)
            }
            Transformed::Empty => {
                tracing::debug!("[{}] nothing to write", source_key);
                Ok(AdvanceOutcome::SkippedEmpty)
            }
            Transformed::Failed(kind, detail) => {
                tracing::warn!("[{}] {}: {}", source_key, kind, detail);
                Ok(AdvanceOutcome::failed(kind, detail))
            }
        }
    }
}
