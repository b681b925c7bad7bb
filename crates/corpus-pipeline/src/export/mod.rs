//! Filtered export of tokenized documents

pub mod engine;
pub mod filters;
pub mod quality;
pub mod record;
pub mod sink;

pub use engine::{ExportEngine, ExportSummary};
pub use filters::{
    percentile, token_hash, Deduplicator, ExportFilter, FilterDecision, PercentileBounds, Sampler,
    TokenBounds,
};
pub use quality::QualityMetrics;
pub use record::{ExportRecord, RecordSelector};
pub use sink::{DatasetHost, HostSink, JsonlGzSink, LocalDatasetHost, RecordSink};
