//! Export engine
//!
//! Streams records out of the parquet (or representations) stage of a
//! dataset, runs them through the [`ExportFilter`] and hands survivors to a
//! sink in `batch_size` batches. Records are read lazily in key order, so
//! the same store contents always produce the same export.
//!
//! Text output and quality scoring decode token ids back to text with the
//! tokenizer that produced them, set through [`ExportEngine::with_decoder`].

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::config::{ExportConfig, ExportFormat, QualityConfig};
use crate::error::{Error, Result};
use crate::pipeline::Stage;
use crate::providers::{list_keys, ObjectStore};
use crate::representation::TokenEncoder;
use crate::storage::ColumnarEncoder;
use crate::types::RepresentationsPayload;

use super::filters::{ExportFilter, FilterDecision, PercentileBounds};
use super::quality::QualityMetrics;
use super::record::{ExportRecord, RecordSelector};
use super::sink::{DatasetHost, HostSink, JsonlGzSink, RecordSink};

/// Objects fetched ahead of the filter
const READ_AHEAD: usize = 8;

/// Counts for one export
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExportSummary {
    /// Records read from the store
    pub read: usize,
    pub exported: usize,
    pub empty: usize,
    pub below_min: usize,
    pub above_max: usize,
    pub low_quality: usize,
    pub outside_percentile: usize,
    pub duplicates: usize,
    pub sampled_out: usize,
    /// Stage objects that could not be decoded
    pub unreadable: usize,
    pub batches: usize,
    /// Token-count bounds derived from the percentile sample
    pub percentile_bounds: Option<PercentileBounds>,
}

impl ExportSummary {
    fn count(&mut self, decision: FilterDecision) {
        match decision {
            FilterDecision::Kept => self.exported += 1,
            FilterDecision::Empty => self.empty += 1,
            FilterDecision::BelowMin => self.below_min += 1,
            FilterDecision::AboveMax => self.above_max += 1,
            FilterDecision::LowQuality => self.low_quality += 1,
            FilterDecision::OutsidePercentile => self.outside_percentile += 1,
            FilterDecision::Duplicate => self.duplicates += 1,
            FilterDecision::SampledOut => self.sampled_out += 1,
        }
    }
}

/// Exports one dataset
pub struct ExportEngine {
    store: Arc<dyn ObjectStore>,
    dataset_id: String,
    key_prefix: Option<String>,
    config: ExportConfig,
    columnar: Arc<dyn ColumnarEncoder>,
    decoder: Option<Arc<dyn TokenEncoder>>,
    list_page_size: usize,
}

/// Decodes selected records and scores them
struct RecordDecoder {
    decoder: Arc<dyn TokenEncoder>,
    quality: QualityConfig,
    keep_text: bool,
    keep_metrics: bool,
}

impl RecordDecoder {
    fn apply(&self, record: &mut ExportRecord) {
        let text = match self.decoder.decode(&record.tokens) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("[{}] Failed to decode tokens: {}", record.identifier, e);
                String::new()
            }
        };
        let metrics = QualityMetrics::measure(&text, &record.tokens, &self.quality);
        record.score = Some(metrics.score());
        if self.keep_metrics {
            record.metrics = Some(metrics);
        }
        if self.keep_text {
            record.text = Some(text);
        }
    }
}

/// Either a batch of records or a stage object that failed to decode
enum ObjectRecords {
    Records(Vec<ExportRecord>),
    Unreadable,
}

impl ExportEngine {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        dataset_id: impl Into<String>,
        key_prefix: Option<String>,
        config: ExportConfig,
        columnar: Arc<dyn ColumnarEncoder>,
    ) -> Result<Self> {
        if !matches!(config.source_stage, Stage::Parquet | Stage::Representations) {
            return Err(Error::Config(format!(
                "export reads the parquet or representations stage, not {}",
                config.source_stage
            )));
        }
        Ok(Self {
            store,
            dataset_id: dataset_id.into(),
            key_prefix: key_prefix.filter(|p| !p.is_empty()),
            config,
            columnar,
            decoder: None,
            list_page_size: 1000,
        })
    }

    /// Tokenizer used to decode records for text output and scoring
    ///
    /// Records are selected by this tokenizer's ids unless the config names
    /// one, in which case the names must agree.
    pub fn with_decoder(mut self, decoder: Arc<dyn TokenEncoder>) -> Result<Self> {
        if let Some(wanted) = self.config.tokenizer.as_deref() {
            if wanted != decoder.name() {
                return Err(Error::Config(format!(
                    "export selects '{}' tokens but decodes with '{}'",
                    wanted,
                    decoder.name()
                )));
            }
        }
        self.decoder = Some(decoder);
        Ok(self)
    }

    pub fn with_list_page_size(mut self, page_size: usize) -> Self {
        self.list_page_size = page_size.max(1);
        self
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    /// Every candidate record, unfiltered, in key order
    pub fn records(&self) -> BoxStream<'static, Result<ExportRecord>> {
        self.object_records()
            .try_filter_map(|batch| async move {
                Ok(match batch {
                    ObjectRecords::Records(records) => {
                        Some(stream::iter(records.into_iter().map(Ok::<_, Error>)))
                    }
                    ObjectRecords::Unreadable => None,
                })
            })
            .try_flatten()
            .boxed()
    }

    fn object_records(&self) -> BoxStream<'static, Result<ObjectRecords>> {
        let stage = self.config.source_stage;
        let prefix = stage.dataset_prefix(&self.dataset_id, self.key_prefix.as_deref());
        let store = self.store.clone();
        let columnar = self.columnar.clone();
        let dataset = self.dataset_id.clone();
        let selector = Arc::new(RecordSelector::new(
            self.config
                .tokenizer
                .clone()
                .or_else(|| self.decoder.as_ref().map(|d| d.name().to_string())),
            self.config.mime_type.clone(),
        ));
        let record_decoder = self
            .decoder
            .clone()
            .filter(|_| self.config.needs_text())
            .map(|decoder| {
                Arc::new(RecordDecoder {
                    decoder,
                    quality: self.config.quality.clone(),
                    keep_text: self.config.format == ExportFormat::Text,
                    keep_metrics: self.config.include_metrics,
                })
            });

        list_keys(self.store.clone(), prefix, self.list_page_size)
            .map_ok(move |key| {
                let store = store.clone();
                let columnar = columnar.clone();
                let dataset = dataset.clone();
                let selector = selector.clone();
                let record_decoder = record_decoder.clone();
                async move {
                    let Some(data) = store.get(&key).await? else {
                        // Deleted between listing and read
                        return Ok(ObjectRecords::Records(Vec::new()));
                    };
                    let decoded = tokio::task::spawn_blocking(move || {
                        let mut records = match stage {
                            Stage::Parquet => selector.from_rows(&dataset, &columnar.decode(&data)?),
                            _ => {
                                let payload: RepresentationsPayload = serde_json::from_slice(&data)?;
                                selector.from_documents(&dataset, &payload.documents)
                            }
                        };
                        if let Some(record_decoder) = &record_decoder {
                            records.iter_mut().for_each(|r| record_decoder.apply(r));
                        }
                        Ok::<_, Error>(records)
                    })
                    .await?;

                    let records = match decoded {
                        Ok(records) => ObjectRecords::Records(records),
                        Err(e) => {
                            tracing::warn!("[{}] Skipping unreadable object: {}", key, e);
                            ObjectRecords::Unreadable
                        }
                    };
                    Ok::<_, Error>(records)
                }
            })
            .try_buffered(READ_AHEAD)
            .boxed()
    }

    /// Drop the fields the configured output does not carry
    fn output_record(&self, mut record: ExportRecord) -> ExportRecord {
        if self.config.format == ExportFormat::Text {
            record.tokens = Vec::new();
        }
        if !self.config.include_score {
            record.score = None;
        }
        record
    }

    /// Run the filters and feed the survivors to `sink`
    pub async fn export_into(&self, sink: &mut dyn RecordSink) -> Result<ExportSummary> {
        if self.config.needs_text() && self.decoder.is_none() {
            return Err(Error::Config(format!(
                "[{}] text output and quality scoring need a tokenizer to decode with",
                self.dataset_id
            )));
        }
        let started = Instant::now();
        let mut summary = ExportSummary::default();
        let mut objects = self.object_records();

        // Percentile bounds come from the first records, before any filtering
        let mut sampled: Vec<ObjectRecords> = Vec::new();
        let percentile = if self.config.percentile_min.is_some() || self.config.percentile_max.is_some() {
            let mut counts = Vec::new();
            while counts.len() < self.config.percentile_sample_size {
                let Some(batch) = objects.try_next().await? else { break };
                if let ObjectRecords::Records(records) = &batch {
                    counts.extend(records.iter().map(|r| r.tokens.len()));
                }
                sampled.push(batch);
            }
            counts.truncate(self.config.percentile_sample_size);
            let bounds = PercentileBounds::from_sample(
                counts,
                self.config.percentile_min,
                self.config.percentile_max,
            );
            tracing::info!(
                "[{}] Percentile bounds: {:?}..={:?}",
                self.dataset_id,
                bounds.lower,
                bounds.upper
            );
            summary.percentile_bounds = Some(bounds);
            Some(bounds)
        } else {
            None
        };

        let mut filter = ExportFilter::from_config(&self.config, percentile);
        let batch_size = self.config.batch_size.max(1);
        let mut batch = Vec::with_capacity(batch_size);
        let mut objects = stream::iter(sampled.into_iter().map(Ok)).chain(objects);

        'objects: while let Some(object) = objects.try_next().await? {
            let records = match object {
                ObjectRecords::Records(records) => records,
                ObjectRecords::Unreadable => {
                    summary.unreadable += 1;
                    continue;
                }
            };

            for record in records {
                if self
                    .config
                    .max_documents
                    .is_some_and(|max| summary.exported >= max)
                {
                    break 'objects;
                }
                summary.read += 1;
                let decision = filter.decide(&record);
                summary.count(decision);
                tracing::trace!("[{}] {:?}", record.identifier, decision);
                if decision == FilterDecision::Kept {
                    batch.push(self.output_record(record));
                    if batch.len() >= batch_size {
                        sink.write_batch(&batch).await?;
                        summary.batches += 1;
                        batch.clear();
                    }
                }
            }
        }

        if !batch.is_empty() {
            sink.write_batch(&batch).await?;
            summary.batches += 1;
        }
        sink.finish().await?;

        tracing::info!(
            "[{}] Exported {}/{} records in {:.1}s ({} duplicates, {} empty, {} below min, {} above max, {} low quality, {} outside percentile, {} sampled out)",
            self.dataset_id,
            summary.exported,
            summary.read,
            started.elapsed().as_secs_f64(),
            summary.duplicates,
            summary.empty,
            summary.below_min,
            summary.above_max,
            summary.low_quality,
            summary.outside_percentile,
            summary.sampled_out
        );
        Ok(summary)
    }

    /// Export to a gzip JSON Lines file
    pub async fn export_to_file(&self, path: impl AsRef<Path>) -> Result<ExportSummary> {
        let mut sink = JsonlGzSink::create(path)?;
        self.export_into(&mut sink).await
    }

    /// Export through a dataset host, one upload per batch
    pub async fn export_to_host(
        &self,
        host: Arc<dyn DatasetHost>,
        destination: &str,
    ) -> Result<ExportSummary> {
        let mut sink = HostSink::new(host, destination);
        self.export_into(&mut sink).await
    }
}
