//! Stage model, per-document transitions and dataset orchestration

pub mod dataset_document;
pub mod dataset_pipeline;
pub mod manifest;
pub mod stage;

pub use dataset_document::{AdvanceOutcome, DatasetDocument, StageTransformer};
pub use dataset_pipeline::{DatasetPipeline, PipelineStatus, RunOptions, StageReport, StageStatus};
pub use manifest::{manifest_key, Manifest, ManifestMetadata};
pub use stage::{stage_key, DocumentKey, Stage};
