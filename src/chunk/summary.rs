use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::StoreError;
use crate::recovery::write_atomic;

/// Totals over all chunks a step ran.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkSummary {
    pub chunks: usize,
    pub total_secs: f64,
    pub min_bytes: u64,
    pub max_bytes: u64,
    pub total_bytes: u64,
}

impl ChunkSummary {
    pub fn record(&mut self, elapsed: Duration, peak_bytes: u64) {
        self.min_bytes = if self.chunks == 0 {
            peak_bytes
        } else {
            self.min_bytes.min(peak_bytes)
        };
        self.max_bytes = self.max_bytes.max(peak_bytes);
        self.total_bytes += peak_bytes;
        self.total_secs += elapsed.as_secs_f64();
        self.chunks += 1;
    }

    pub fn merge(&mut self, other: &ChunkSummary) {
        if other.chunks == 0 {
            return;
        }
        self.min_bytes = if self.chunks == 0 {
            other.min_bytes
        } else {
            self.min_bytes.min(other.min_bytes)
        };
        self.max_bytes = self.max_bytes.max(other.max_bytes);
        self.total_bytes += other.total_bytes;
        self.total_secs += other.total_secs;
        self.chunks += other.chunks;
    }

    pub fn mean_bytes(&self) -> f64 {
        if self.chunks == 0 {
            0.0
        } else {
            self.total_bytes as f64 / self.chunks as f64
        }
    }
}

/// Chunk summaries of every chunked step, by step name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkLog(pub BTreeMap<String, ChunkSummary>);

impl ChunkLog {
    pub const FILE: &'static str = "chunk_summary.json";

    pub fn record(&mut self, step: &str, elapsed: Duration, peak_bytes: u64) {
        self.0
            .entry(step.to_string())
            .or_default()
            .record(elapsed, peak_bytes);
    }

    /// Fold in the log of another worker.
    pub fn merge(&mut self, other: &ChunkLog) {
        for (step, summary) in &other.0 {
            self.0.entry(step.clone()).or_default().merge(summary);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn log_summary(&self) {
        for (step, s) in &self.0 {
            tracing::info!(
                "Chunk summary for step {step:?}: {} chunks in {:.3}s, memory min {} / max {} / mean {:.0} bytes",
                s.chunks,
                s.total_secs,
                s.min_bytes,
                s.max_bytes,
                s.mean_bytes()
            );
        }
    }

    pub fn write_json(&self, dir: &Path) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(self).map_err(|source| StoreError::Codec {
            what: "chunk summary".to_string(),
            source,
        })?;
        write_atomic(&dir.join(Self::FILE), &bytes)
    }
}

#[test]
fn merge_across_workers() {
    let mut a = ChunkLog::default();
    a.record("persons", Duration::from_secs(1), 300);
    a.record("persons", Duration::from_secs(2), 100);
    let mut b = ChunkLog::default();
    b.record("persons", Duration::from_secs(1), 900);
    b.record("tours", Duration::from_secs(1), 50);

    a.merge(&b);
    let persons = &a.0["persons"];
    assert_eq!(persons.chunks, 3);
    assert_eq!(persons.min_bytes, 100);
    assert_eq!(persons.max_bytes, 900);
    assert_eq!(persons.mean_bytes(), 1300.0 / 3.0);
    assert_eq!(persons.total_secs, 4.0);
    assert_eq!(a.0["tours"].min_bytes, 50);
}
