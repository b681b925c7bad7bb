//! Concurrent stage runs with progress tracking

mod progress;
mod worker;

pub use progress::{CancellationFlag, KeyRecord, KeyStatus, ProgressSnapshot, ProgressTracker};
pub use worker::{RunEnd, StageWorkerPool};
