//! In-memory poll-cycle counters plus latency sampling. `snapshot()` is an
//! immutable point-in-time read; `emit` appends one JSONL line per poll
//! cycle to the metrics sink.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct MetricsCollector {
    processed: AtomicU64,
    stored: AtomicU64,
    review_required: AtomicU64,
    failed: AtomicU64,
    duplicate_skipped: AtomicU64,
    extraction_latency_ms: Mutex<Vec<f64>>,
    pipeline_latency_ms: Mutex<Vec<f64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LatencySummary {
    pub count: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
}

impl LatencySummary {
    fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let count = samples.len();
        let min_ms = samples.iter().cloned().fold(f64::INFINITY, f64::min);
        let max_ms = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let mean_ms = samples.iter().sum::<f64>() / count as f64;
        Self { count, min_ms, max_ms, mean_ms }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub recorded_at: DateTime<Utc>,
    pub processed: u64,
    pub stored: u64,
    pub review_required: u64,
    pub failed: u64,
    pub duplicate_skipped: u64,
    pub extraction_latency: LatencySummary,
    pub pipeline_latency: LatencySummary,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stored(&self) {
        self.stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_review_required(&self) {
        self.review_required.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate_skipped(&self) {
        self.duplicate_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sample_extraction_latency(&self, ms: f64) {
        self.extraction_latency_ms.lock().unwrap().push(ms);
    }

    pub fn sample_pipeline_latency(&self, ms: f64) {
        self.pipeline_latency_ms.lock().unwrap().push(ms);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            recorded_at: Utc::now(),
            processed: self.processed.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            review_required: self.review_required.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            duplicate_skipped: self.duplicate_skipped.load(Ordering::Relaxed),
            extraction_latency: LatencySummary::from_samples(&self.extraction_latency_ms.lock().unwrap()),
            pipeline_latency: LatencySummary::from_samples(&self.pipeline_latency_ms.lock().unwrap()),
        }
    }

    /// Appends `snapshot` as one JSON-lines record to `path`, creating parent
    /// directories as needed. Writers open in append mode and write one
    /// `write()` per record (atomic single-line writes).
    pub fn emit(&self, path: impl AsRef<Path>) -> Result<MetricsSnapshot> {
        let snapshot = self.snapshot();
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create_dir_all {parent:?}"))?;
        }
        let mut line = serde_json::to_string(&snapshot).context("serialize metrics snapshot")?;
        line.push('\n');
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open metrics sink {path:?}"))?;
        f.write_all(line.as_bytes()).context("write metrics line")?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = MetricsCollector::new();
        let s = m.snapshot();
        assert_eq!(s.processed, 0);
        assert_eq!(s.stored, 0);
    }

    #[test]
    fn counters_increment_independently() {
        let m = MetricsCollector::new();
        m.record_processed();
        m.record_processed();
        m.record_stored();
        m.record_review_required();
        m.record_failed();
        m.record_duplicate_skipped();

        let s = m.snapshot();
        assert_eq!(s.processed, 2);
        assert_eq!(s.stored, 1);
        assert_eq!(s.review_required, 1);
        assert_eq!(s.failed, 1);
        assert_eq!(s.duplicate_skipped, 1);
    }

    #[test]
    fn latency_summary_computes_min_max_mean() {
        let m = MetricsCollector::new();
        m.sample_extraction_latency(100.0);
        m.sample_extraction_latency(200.0);
        m.sample_extraction_latency(300.0);

        let s = m.snapshot();
        assert_eq!(s.extraction_latency.count, 3);
        assert_eq!(s.extraction_latency.min_ms, 100.0);
        assert_eq!(s.extraction_latency.max_ms, 300.0);
        assert_eq!(s.extraction_latency.mean_ms, 200.0);
    }

    #[test]
    fn emit_appends_one_line_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let m = MetricsCollector::new();
        m.record_processed();
        m.emit(&path).unwrap();
        m.record_processed();
        m.emit(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
