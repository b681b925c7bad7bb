//! Run progress and per-key status
//!
//! Counters are atomics so any number of workers can report concurrently
//! and a snapshot can be taken mid-run without locking.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, ErrorKind, Result};

/// Final state of one key in a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum KeyStatus {
    Written,
    Skipped { reason: String },
    Failed { kind: ErrorKind, detail: String },
}

impl KeyStatus {
    pub fn label(&self) -> &'static str {
        match self {
            KeyStatus::Written => "written",
            KeyStatus::Skipped { .. } => "skipped",
            KeyStatus::Failed { .. } => "failed",
        }
    }
}

/// Per-key progress record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key: String,
    #[serde(flatten)]
    pub status: KeyStatus,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// Point-in-time counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Keys dispatched so far
    pub total: usize,
    pub processed: usize,
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ProgressSnapshot {
    pub fn percent_complete(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        self.processed as f32 / self.total as f32 * 100.0
    }
}

/// Progress of one stage run
pub struct ProgressTracker {
    label: String,
    progress_interval: usize,
    started: Instant,
    total: AtomicUsize,
    processed: AtomicUsize,
    written: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    records: DashMap<String, KeyRecord>,
    failures_by_kind: DashMap<ErrorKind, usize>,
}

impl ProgressTracker {
    pub fn new(label: impl Into<String>, progress_interval: usize) -> Self {
        Self {
            label: label.into(),
            progress_interval: progress_interval.max(1),
            started: Instant::now(),
            total: AtomicUsize::new(0),
            processed: AtomicUsize::new(0),
            written: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            records: DashMap::new(),
            failures_by_kind: DashMap::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Count a key handed to the workers
    pub fn add_dispatched(&self, count: usize) {
        self.total.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record(&self, key: &str, status: KeyStatus, duration: Duration) {
        match &status {
            KeyStatus::Written => {
                self.written.fetch_add(1, Ordering::Relaxed);
            }
            KeyStatus::Skipped { .. } => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
            }
            KeyStatus::Failed { kind, .. } => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                *self.failures_by_kind.entry(*kind).or_insert(0) += 1;
            }
        }

        self.records.insert(
            key.to_string(),
            KeyRecord {
                key: key.to_string(),
                status,
                duration_ms: duration.as_millis() as u64,
                completed_at: Utc::now(),
            },
        );

        let processed = self.processed.fetch_add(1, Ordering::AcqRel) + 1;
        if processed % self.progress_interval == 0 {
            let snapshot = self.snapshot();
            tracing::info!(
                "[{}] {}/{} processed ({} written, {} skipped, {} failed) in {:.1}s",
                self.label,
                processed,
                snapshot.total,
                snapshot.written,
                snapshot.skipped,
                snapshot.failed,
                self.started.elapsed().as_secs_f64()
            );
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Acquire),
            written: self.written.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    pub fn failures_of_kind(&self, kind: ErrorKind) -> usize {
        self.failures_by_kind.get(&kind).map(|n| *n).unwrap_or(0)
    }

    pub fn status_of(&self, key: &str) -> Option<KeyStatus> {
        self.records.get(key).map(|r| r.status.clone())
    }

    /// Failed keys in sorted order
    pub fn failed_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .records
            .iter()
            .filter(|r| matches!(r.status, KeyStatus::Failed { .. }))
            .map(|r| r.key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Records sorted by key
    pub fn records(&self) -> Vec<KeyRecord> {
        let mut records: Vec<KeyRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    /// Per-key status as CSV (`key,status,error_kind,detail,duration_ms,completed_at`)
    pub fn to_csv(&self) -> Result<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(["key", "status", "error_kind", "detail", "duration_ms", "completed_at"])
            .map_err(csv_error)?;

        for record in self.records() {
            let (kind, detail) = match &record.status {
                KeyStatus::Written => (String::new(), String::new()),
                KeyStatus::Skipped { reason } => (String::new(), reason.clone()),
                KeyStatus::Failed { kind, detail } => (kind.to_string(), detail.clone()),
            };
            writer
                .write_record([
                    record.key.as_str(),
                    record.status.label(),
                    kind.as_str(),
                    detail.as_str(),
                    record.duration_ms.to_string().as_str(),
                    record.completed_at.to_rfc3339().as_str(),
                ])
                .map_err(csv_error)?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| Error::encoding(format!("CSV flush: {}", e)))?;
        String::from_utf8(bytes).map_err(|e| Error::encoding(format!("CSV output: {}", e)))
    }

    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_csv()?)?;
        Ok(())
    }
}

fn csv_error(e: csv::Error) -> Error {
    Error::encoding(format!("CSV: {}", e))
}

/// Cooperative stop signal shared between a run and its controller
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_failed_keys() {
        let tracker = ProgressTracker::new("docs", 100);
        tracker.add_dispatched(3);
        tracker.record("b", KeyStatus::Written, Duration::from_millis(5));
        tracker.record(
            "c",
            KeyStatus::Failed {
                kind: ErrorKind::ExtractionFailed,
                detail: "all strategies failed".to_string(),
            },
            Duration::from_millis(7),
        );
        tracker.record(
            "a",
            KeyStatus::Skipped {
                reason: "exists".to_string(),
            },
            Duration::ZERO,
        );

        assert_eq!(
            tracker.snapshot(),
            ProgressSnapshot {
                total: 3,
                processed: 3,
                written: 1,
                skipped: 1,
                failed: 1
            }
        );
        assert_eq!(tracker.failed_keys(), vec!["c".to_string()]);
        assert_eq!(tracker.failures_of_kind(ErrorKind::ExtractionFailed), 1);
        assert_eq!(tracker.status_of("b"), Some(KeyStatus::Written));
    }

    #[test]
    fn test_csv_export() {
        let tracker = ProgressTracker::new("docs", 10);
        tracker.record(
            "x/1.json",
            KeyStatus::Failed {
                kind: ErrorKind::Timeout,
                detail: "Timed out after 5s, retry later".to_string(),
            },
            Duration::from_millis(5000),
        );

        let csv = tracker.to_csv().unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("key,status,error_kind,detail,duration_ms,completed_at"));
        let row = lines.next().unwrap();
        assert!(row.starts_with("x/1.json,failed,timeout,\"Timed out after 5s, retry later\",5000,"));
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let tracker = Arc::new(ProgressTracker::new("docs", 1000));
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    for i in 0..250 {
                        tracker.add_dispatched(1);
                        tracker.record(&format!("{}-{}", worker, i), KeyStatus::Written, Duration::ZERO);
                    }
                })
            })
            .collect();
        futures::future::join_all(handles).await;

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.processed, 2000);
        assert_eq!(snapshot.written, 2000);
        assert_eq!(snapshot.total, 2000);
    }

    #[test]
    fn test_cancellation_flag_is_shared() {
        let flag = CancellationFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_cancelled());
        clone.cancel();
        assert!(flag.is_cancelled());
    }
}
