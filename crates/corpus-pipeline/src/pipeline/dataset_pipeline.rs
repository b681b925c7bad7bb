//! Dataset pipeline orchestration
//!
//! Drives every document of a dataset (optionally narrowed to a key prefix)
//! from one stage to the next. Runs are idempotent: only keys missing from
//! the target stage are dispatched unless clobber is set, so an interrupted
//! run is resumed by simply running it again.

use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use crate::config::{IndexConfig, PipelineConfig, ProcessingConfig};
use crate::error::{Error, ErrorKind, Result};
use crate::processing::{CancellationFlag, KeyStatus, ProgressSnapshot, ProgressTracker, RunEnd, StageWorkerPool};
use crate::providers::{list_keys, ObjectMetadata, ObjectStore};
use crate::storage::{ColumnarEncoder, ParquetEncoder};
use crate::types::RepresentationsPayload;

use super::dataset_document::{AdvanceOutcome, DatasetDocument, StageTransformer};
use super::manifest::{manifest_key, Manifest};
use super::stage::{stage_key, DocumentKey, Stage};

/// Existence checks in flight while diffing
const DIFF_CONCURRENCY: usize = 16;

/// Per-run knobs
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Worker count (default: `processing.max_workers`)
    pub concurrency: Option<usize>,
    /// Raw content ceiling for 1 -> 2 (default: `processing.max_size`)
    pub size_limit: Option<usize>,
    /// Rewrite targets that already exist
    pub clobber: bool,
}

/// Outcome of one `process_stage` run
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub source: Stage,
    pub target: Stage,
    #[serde(flatten)]
    pub snapshot: ProgressSnapshot,
    pub cancelled: bool,
    pub failed_keys: Vec<String>,
    pub elapsed_secs: f64,
}

/// Counts for one stage of a dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageStatus {
    pub stage: Stage,
    pub count: usize,
    /// Documents present in the previous stage but not in this one
    pub missing: Option<usize>,
}

/// Per-stage counts for a dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStatus {
    pub dataset_id: String,
    pub key_prefix: Option<String>,
    pub stages: Vec<StageStatus>,
}

impl PipelineStatus {
    /// `Stage,Count,Missing`, one row per document stage
    pub fn to_csv(&self) -> Result<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(["Stage", "Count", "Missing"])
            .map_err(|e| Error::encoding(format!("CSV: {}", e)))?;
        for status in &self.stages {
            let missing = status.missing.map(|m| m.to_string()).unwrap_or_default();
            writer
                .write_record([status.stage.as_str(), &status.count.to_string(), &missing])
                .map_err(|e| Error::encoding(format!("CSV: {}", e)))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| Error::encoding(format!("CSV flush: {}", e)))?;
        String::from_utf8(bytes).map_err(|e| Error::encoding(format!("CSV output: {}", e)))
    }
}

/// Orchestrates stage transitions for one dataset
pub struct DatasetPipeline {
    store: Arc<dyn ObjectStore>,
    dataset_id: String,
    key_prefix: Option<String>,
    /// Only stage runs need parsers and tokenizers
    transformer: Option<Arc<StageTransformer>>,
    columnar: Arc<dyn ColumnarEncoder>,
    processing: ProcessingConfig,
    index: IndexConfig,
    list_page_size: usize,
}

impl DatasetPipeline {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        dataset_id: impl Into<String>,
        key_prefix: Option<String>,
        config: &PipelineConfig,
    ) -> Result<Self> {
        let dataset_id = dataset_id.into();
        // Reuse key validation for the dataset id
        DocumentKey::new(dataset_id.clone(), "_")?;

        Ok(Self {
            store,
            dataset_id,
            key_prefix: key_prefix.filter(|p| !p.is_empty()),
            transformer: None,
            columnar: Arc::new(ParquetEncoder),
            processing: config.processing.clone(),
            index: config.index.clone(),
            list_page_size: config.store.list_page_size,
        })
    }

    /// Attach the parsers, tokenizers and encoder used by stage runs
    pub fn with_transformer(mut self, transformer: Arc<StageTransformer>) -> Self {
        self.columnar = transformer.columnar();
        self.transformer = Some(transformer);
        self
    }

    pub fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    pub fn key_prefix(&self) -> Option<&str> {
        self.key_prefix.as_deref()
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    /// Lazily list the documents present in `stage`
    ///
    /// Keys that do not parse as document keys are logged and skipped.
    pub fn list_documents(&self, stage: Stage) -> BoxStream<'static, Result<DocumentKey>> {
        let prefix = stage.dataset_prefix(&self.dataset_id, self.key_prefix.as_deref());
        list_keys(self.store.clone(), prefix, self.list_page_size)
            .try_filter_map(|key| async move {
                match DocumentKey::from_stage_key(&key) {
                    Ok((_, doc)) => Ok(Some(doc)),
                    Err(e) => {
                        tracing::warn!("[{}] Ignoring object: {}", key, e);
                        Ok(None)
                    }
                }
            })
            .boxed()
    }

    /// Documents in `source` that are absent from `target`
    ///
    /// With `clobber` every source document is yielded. The stream is lazy
    /// and restartable: dropping it and calling again re-lists from the start.
    pub fn diff_missing(
        &self,
        source: Stage,
        target: Stage,
        clobber: bool,
    ) -> BoxStream<'static, Result<DocumentKey>> {
        let documents = self.list_documents(source);
        if clobber {
            return documents;
        }

        let store = self.store.clone();
        documents
            .map(move |doc| {
                let store = store.clone();
                async move {
                    let doc = doc?;
                    let exists = store.exists(&stage_key(target, &doc)?).await?;
                    Ok::<_, Error>((!exists).then_some(doc))
                }
            })
            .buffered(DIFF_CONCURRENCY)
            .try_filter_map(|doc| async move { Ok(doc) })
            .boxed()
    }

    /// Advance every missing document from `source` to `target`
    pub async fn process_stage(
        &self,
        source: Stage,
        target: Stage,
        options: &RunOptions,
    ) -> Result<StageReport> {
        let label = format!("{}:{}->{}", self.dataset_id, source, target);
        let tracker = Arc::new(ProgressTracker::new(label, self.processing.progress_interval));
        self.process_stage_with(source, target, options, tracker, &CancellationFlag::new())
            .await
    }

    /// [`DatasetPipeline::process_stage`] with a caller-owned tracker and stop flag
    ///
    /// The tracker can be polled while the run is in progress and exported
    /// as CSV afterwards.
    pub async fn process_stage_with(
        &self,
        source: Stage,
        target: Stage,
        options: &RunOptions,
        tracker: Arc<ProgressTracker>,
        cancel: &CancellationFlag,
    ) -> Result<StageReport> {
        Stage::check_transition(source, target)?;
        let transformer = self.transformer.clone().ok_or_else(|| {
            Error::Config(format!("[{}] stage runs need a transformer", self.dataset_id))
        })?;
        let started = Instant::now();

        let mut pool = StageWorkerPool::from_config(&self.processing);
        if let Some(workers) = options.concurrency {
            pool = pool.with_workers(workers);
        }
        let size_limit = options.size_limit.unwrap_or(self.processing.max_size);
        let clobber = options.clobber;

        tracing::info!(
            "[{}] Processing {} -> {} (prefix: {}, clobber: {})",
            self.dataset_id,
            source,
            target,
            self.key_prefix.as_deref().unwrap_or("-"),
            clobber
        );

        // Keys are dispatched as full source-stage keys so progress records
        // and failed-key lists point at real objects
        let keys = self
            .diff_missing(source, target, clobber)
            .and_then(move |doc| async move { stage_key(source, &doc) });

        let store = self.store.clone();
        let run = pool
            .run(keys, tracker.clone(), cancel, move |key| {
                let store = store.clone();
                let transformer = transformer.clone();
                async move {
                    let document = match DatasetDocument::from_key(store, &key) {
                        Ok(document) => document.with_size_limit(Some(size_limit)),
                        Err(e) => return failed_status(&e),
                    };
                    match document.advance(source, target, clobber, &transformer).await {
                        Ok(outcome) => outcome_status(outcome),
                        Err(e) => {
                            tracing::error!("[{}] {}", key, e);
                            failed_status(&e)
                        }
                    }
                }
            })
            .await?;

        let snapshot = tracker.snapshot();
        if snapshot.processed > 0
            && tracker.failures_of_kind(ErrorKind::StoreUnavailable) == snapshot.processed
        {
            return Err(Error::store_unavailable(format!(
                "all {} jobs of {} -> {} lost the store",
                snapshot.processed, source, target
            )));
        }

        let report = StageReport {
            source,
            target,
            snapshot,
            cancelled: run == RunEnd::Cancelled,
            failed_keys: tracker.failed_keys(),
            elapsed_secs: started.elapsed().as_secs_f64(),
        };
        tracing::info!(
            "[{}] {} -> {} done in {:.1}s: {} written, {} skipped, {} failed{}",
            self.dataset_id,
            source,
            target,
            report.elapsed_secs,
            report.snapshot.written,
            report.snapshot.skipped,
            report.snapshot.failed,
            if report.cancelled { " (cancelled)" } else { "" }
        );
        Ok(report)
    }

    /// Write the manifest for `stage` and return it
    pub async fn build_index(&self, stage: Stage) -> Result<Manifest> {
        if stage == Stage::Index {
            return Err(Error::Config("the index stage has no manifest of its own".to_string()));
        }
        let prefix = stage.dataset_prefix(&self.dataset_id, self.key_prefix.as_deref());
        let objects: Vec<String> = list_keys(self.store.clone(), prefix, self.list_page_size)
            .try_collect()
            .await?;

        let token_totals = if self.index.token_totals && stage != Stage::Documents {
            Some(self.token_totals(stage, &objects).await?)
        } else {
            None
        };

        let manifest = Manifest::new(
            &self.dataset_id,
            self.key_prefix.as_deref(),
            stage,
            objects,
            token_totals,
        );
        let key = manifest_key(&self.dataset_id, self.key_prefix.as_deref(), stage);
        self.store
            .put(
                &key,
                Bytes::from(manifest.to_bytes()?),
                &ObjectMetadata::with_content_type("application/gzip"),
            )
            .await?;

        tracing::info!("[{}] Wrote {} ({} objects)", self.dataset_id, key, manifest.metadata.count);
        Ok(manifest)
    }

    /// Read the stored manifest for `stage`, if any
    pub async fn load_index(&self, stage: Stage) -> Result<Option<Manifest>> {
        let key = manifest_key(&self.dataset_id, self.key_prefix.as_deref(), stage);
        match self.store.get(&key).await? {
            Some(data) => Manifest::from_bytes(&data).map(Some),
            None => Ok(None),
        }
    }

    async fn token_totals(&self, stage: Stage, objects: &[String]) -> Result<BTreeMap<String, u64>> {
        let columnar = self.columnar.clone();
        let store = self.store.clone();
        let per_object: Vec<BTreeMap<String, u64>> = futures::stream::iter(objects.iter().cloned())
            .map(|key| {
                let store = store.clone();
                let columnar = columnar.clone();
                async move {
                    let Some(data) = store.get(&key).await? else {
                        return Ok(BTreeMap::new());
                    };
                    let mut totals = BTreeMap::new();
                    match stage {
                        Stage::Parquet => {
                            for row in columnar.decode(&data)? {
                                *totals.entry(row.tokenizer).or_insert(0u64) += row.tokens.len() as u64;
                            }
                        }
                        _ => {
                            let payload: RepresentationsPayload = serde_json::from_slice(&data)?;
                            for doc in &payload.documents {
                                for (name, count) in doc.token_totals() {
                                    *totals.entry(name).or_insert(0u64) += count;
                                }
                            }
                        }
                    }
                    Ok::<_, Error>(totals)
                }
            })
            .buffer_unordered(self.processing.workers())
            .try_collect()
            .await?;

        let mut totals = BTreeMap::new();
        for object in per_object {
            for (name, count) in object {
                *totals.entry(name).or_insert(0u64) += count;
            }
        }
        Ok(totals)
    }

    /// Number of objects in each document stage
    pub async fn document_counts(&self) -> Result<BTreeMap<Stage, usize>> {
        let mut counts = BTreeMap::new();
        for stage in Stage::DOCUMENT_STAGES {
            let count = self
                .list_documents(stage)
                .try_fold(0usize, |n, _| async move { Ok(n + 1) })
                .await?;
            counts.insert(stage, count);
        }
        Ok(counts)
    }

    /// Per-stage counts plus documents still missing from each later stage
    pub async fn status(&self) -> Result<PipelineStatus> {
        let mut stages = Vec::new();
        let mut previous: Option<BTreeSet<DocumentKey>> = None;

        for stage in Stage::DOCUMENT_STAGES {
            let present: BTreeSet<DocumentKey> = self.list_documents(stage).try_collect().await?;
            let missing = previous
                .as_ref()
                .map(|prev| prev.difference(&present).count());
            stages.push(StageStatus {
                stage,
                count: present.len(),
                missing,
            });
            previous = Some(present);
        }

        Ok(PipelineStatus {
            dataset_id: self.dataset_id.clone(),
            key_prefix: self.key_prefix.clone(),
            stages,
        })
    }
}

fn outcome_status(outcome: AdvanceOutcome) -> KeyStatus {
    match outcome {
        AdvanceOutcome::Written => KeyStatus::Written,
        AdvanceOutcome::SkippedExists => KeyStatus::Skipped {
            reason: "target exists".to_string(),
        },
        AdvanceOutcome::SkippedEmpty => KeyStatus::Skipped {
            reason: "no content".to_string(),
        },
        AdvanceOutcome::Failed { kind, detail } => KeyStatus::Failed { kind, detail },
    }
}

fn failed_status(e: &Error) -> KeyStatus {
    KeyStatus::Failed {
        kind: e.kind(),
        detail: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MemoryObjectStore;
    use crate::testing::{put_source, test_transformer};

    async fn seeded_store(paths: &[&str]) -> Arc<MemoryObjectStore> {
        let store = Arc::new(MemoryObjectStore::new());
        for path in paths {
            let text = format!("contents of {}", path);
            put_source(&store, "edgar", path, Some("text/plain"), text.as_bytes()).await;
        }
        store
    }

    fn pipeline(store: &Arc<MemoryObjectStore>, prefix: Option<&str>) -> DatasetPipeline {
        let mut config = PipelineConfig::default();
        config.processing.max_workers = Some(4);
        config.store.list_page_size = 2;
        config.index.token_totals = true;
        DatasetPipeline::new(
            store.clone(),
            "edgar",
            prefix.map(str::to_string),
            &config,
        )
        .unwrap()
        .with_transformer(Arc::new(test_transformer()))
    }

    async fn collect(stream: BoxStream<'static, Result<DocumentKey>>) -> Vec<String> {
        stream
            .map_ok(|doc| doc.path().to_string())
            .try_collect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_diff_missing() {
        let store = seeded_store(&["a.json", "b.json", "c.json"]).await;
        store
            .put("representations/edgar/b.json", Bytes::from_static(b"{}"), &ObjectMetadata::default())
            .await
            .unwrap();
        let pipeline = pipeline(&store, None);

        let missing = collect(pipeline.diff_missing(Stage::Documents, Stage::Representations, false)).await;
        assert_eq!(missing, vec!["a.json", "c.json"]);

        let all = collect(pipeline.diff_missing(Stage::Documents, Stage::Representations, true)).await;
        assert_eq!(all, vec!["a.json", "b.json", "c.json"]);
    }

    #[tokio::test]
    async fn test_key_prefix_excludes_sibling_collections() {
        let store = seeded_store(&["2024/a.json", "2024-old/b.json", "20245/c.json"]).await;
        let pipeline = pipeline(&store, Some("2024"));

        let missing = collect(pipeline.diff_missing(Stage::Documents, Stage::Representations, false)).await;
        assert_eq!(missing, vec!["2024/a.json"]);

        let report = pipeline
            .process_stage(Stage::Documents, Stage::Representations, &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(report.snapshot.written, 1);
        assert!(!store.exists("representations/edgar/2024-old/b.json").await.unwrap());
        assert!(!store.exists("representations/edgar/20245/c.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_diff_against_columnar_stage_ignores_suffix() {
        let store = seeded_store(&["a.json"]).await;
        store
            .put("representations/edgar/a.json", Bytes::from_static(b"{}"), &ObjectMetadata::default())
            .await
            .unwrap();
        store
            .put("parquet/edgar/a", Bytes::from_static(b"x"), &ObjectMetadata::default())
            .await
            .unwrap();
        let pipeline = pipeline(&store, None);

        let missing = collect(pipeline.diff_missing(Stage::Representations, Stage::Parquet, false)).await;
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn test_process_stage_is_idempotent() {
        let store = seeded_store(&["a.json", "b.json", "c.json", "d.json", "e.json"]).await;
        let pipeline = pipeline(&store, None);

        let first = pipeline
            .process_stage(Stage::Documents, Stage::Representations, &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(first.snapshot.written, 5);
        assert_eq!(first.snapshot.failed, 0);

        let second = pipeline
            .process_stage(Stage::Documents, Stage::Representations, &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(second.snapshot.total, 0);
        assert_eq!(second.snapshot.written, 0);

        let clobbered = pipeline
            .process_stage(
                Stage::Documents,
                Stage::Representations,
                &RunOptions {
                    clobber: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(clobbered.snapshot.written, 5);

        let columnar = pipeline
            .process_stage(Stage::Representations, Stage::Parquet, &RunOptions::default())
            .await
            .unwrap();
        assert_eq!(columnar.snapshot.written, 5);
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_fatal() {
        let store = seeded_store(&["good.json"]).await;
        put_source(&store, "edgar", "bad.json", Some("application/json"), b"{broken").await;
        put_source(&store, "edgar", "empty.json", Some("text/plain"), b"VerDate only").await;
        let pipeline = pipeline(&store, None);

        let report = pipeline
            .process_stage(Stage::Documents, Stage::Representations, &RunOptions::default())
            .await
            .unwrap();

        assert_eq!(report.snapshot.written, 1);
        assert_eq!(report.snapshot.skipped, 1);
        assert_eq!(report.snapshot.failed, 1);
        assert_eq!(report.failed_keys, vec!["documents/edgar/bad.json".to_string()]);
        assert!(!store.exists("representations/edgar/empty.json").await.unwrap());
        assert!(!store.exists("representations/edgar/bad.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_store_unavailable_fails_the_run() {
        let store = seeded_store(&["a.json"]).await;
        store.set_online(false);
        let pipeline = pipeline(&store, None);

        let err = pipeline
            .process_stage(Stage::Documents, Stage::Representations, &RunOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    }

    #[tokio::test]
    async fn test_concurrent_disjoint_runs_share_counters() {
        let store = Arc::new(MemoryObjectStore::new());
        for i in 0..20 {
            let text = format!("document number {}", i);
            put_source(&store, "edgar", &format!("left/{:02}.json", i), Some("text/plain"), text.as_bytes()).await;
            put_source(&store, "edgar", &format!("right/{:02}.json", i), Some("text/plain"), text.as_bytes()).await;
        }
        let left = pipeline(&store, Some("left"));
        let right = pipeline(&store, Some("right/"));
        let tracker = Arc::new(ProgressTracker::new("both", 1000));
        let cancel = CancellationFlag::new();
        let options = RunOptions::default();

        let (a, b) = tokio::join!(
            left.process_stage_with(Stage::Documents, Stage::Representations, &options, tracker.clone(), &cancel),
            right.process_stage_with(Stage::Documents, Stage::Representations, &options, tracker.clone(), &cancel),
        );
        a.unwrap();
        b.unwrap();

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.total, 40);
        assert_eq!(snapshot.processed, 40);
        assert_eq!(snapshot.written, 40);
        assert_eq!(tracker.records().len(), 40);
    }

    #[tokio::test]
    async fn test_status_and_index_without_transformer() {
        let store = seeded_store(&["a.json", "b.json"]).await;
        let mut config = PipelineConfig::default();
        config.index.token_totals = true;
        // unreadable tokenizer file: only stage runs would load it
        config.representation.tokenizers.push(crate::config::TokenizerSpec {
            name: "missing".to_string(),
            path: "/nonexistent/tokenizer.json".into(),
        });
        let bare = DatasetPipeline::new(store.clone(), "edgar", None, &config).unwrap();

        let status = bare.status().await.unwrap();
        assert_eq!(status.stages[0].count, 2);
        assert_eq!(status.stages[1].missing, Some(2));

        let manifest = bare.build_index(Stage::Representations).await.unwrap();
        assert_eq!(manifest.metadata.count, 0);

        let err = bare
            .process_stage(Stage::Documents, Stage::Representations, &RunOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_index_and_status() {
        let store = seeded_store(&["a.json", "b.json", "c.json"]).await;
        let pipeline = pipeline(&store, None);
        pipeline
            .process_stage(Stage::Documents, Stage::Representations, &RunOptions::default())
            .await
            .unwrap();
        store.delete("representations/edgar/c.json").await.unwrap();

        let manifest = pipeline.build_index(Stage::Representations).await.unwrap();
        assert_eq!(manifest.metadata.count, 2);
        // "contents of a.json" -> three words
        assert_eq!(manifest.metadata.token_totals.as_ref().unwrap()["words"], 6);
        assert!(store.exists("index/edgar.json.gz").await.unwrap());

        let loaded = pipeline.load_index(Stage::Representations).await.unwrap().unwrap();
        assert_eq!(loaded.objects, manifest.objects);
        assert!(pipeline.load_index(Stage::Parquet).await.unwrap().is_none());

        let status = pipeline.status().await.unwrap();
        assert_eq!(status.stages[0].count, 3);
        assert_eq!(status.stages[0].missing, None);
        assert_eq!(status.stages[1].count, 2);
        assert_eq!(status.stages[1].missing, Some(1));
        assert_eq!(status.stages[2].missing, Some(2));
        assert_eq!(
            status.to_csv().unwrap(),
            "Stage,Count,Missing\ndocuments,3,\nrepresentations,2,1\nparquet,0,2\n"
        );

        let counts = pipeline.document_counts().await.unwrap();
        assert_eq!(counts[&Stage::Documents], 3);
        assert_eq!(counts[&Stage::Parquet], 0);
    }
}
