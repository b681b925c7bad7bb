//! corpus-pipeline: staged document pipeline for language model training data
//!
//! Raw documents collected into an object store move through three stages:
//!
//! 1. `documents/`: source envelopes (HTML, PDF, XML, JSON, archives, ...)
//! 2. `representations/`: parsed, filtered and tokenized text
//! 3. `parquet/`: columnar token shards
//!
//! [`pipeline::DatasetPipeline`] drives a dataset between stages with a
//! bounded worker pool, and [`export::ExportEngine`] turns the final stage
//! into a deduplicated, filtered delivery artifact.

pub mod config;
pub mod error;
pub mod export;
pub mod ingestion;
pub mod pipeline;
pub mod processing;
pub mod providers;
pub mod representation;
pub mod storage;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::PipelineConfig;
pub use error::{Error, ErrorKind, Result};
pub use pipeline::{
    AdvanceOutcome, DatasetDocument, DatasetPipeline, DocumentKey, RunOptions, Stage, StageTransformer,
};
pub use types::{ParsedDocument, Representation, SourceDocument};
