//! Scheduler statistics.
//!
//! Counters are plain atomics bumped on the hot paths; a snapshot can be
//! taken at any time and dumped as JSON together with per-file aggregation
//! statistics.

use crate::error::Result;
use crate::file_queues::FileSnapshot;
use crate::policy::PolicyKind;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub received: AtomicU64,
    pub dispatched_requests: AtomicU64,
    pub dispatched_entries: AtomicU64,
    pub released: AtomicU64,
    pub released_bytes: AtomicU64,
    pub cancelled: AtomicU64,
    pub aggregations: AtomicU64,
    pub max_aggregation: AtomicU64,
    pub migrations: AtomicU64,
    pub lock_retries: AtomicU64,
    pub waits: AtomicU64,
    pub not_found: AtomicU64,
    per_policy: [AtomicU64; PolicyKind::COUNT],
}

impl SchedulerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self, aggregated: bool) {
        self.received.fetch_add(1, Ordering::Relaxed);
        if aggregated {
            self.aggregations.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_dispatch(&self, policy: PolicyKind, count: usize) {
        self.dispatched_entries.fetch_add(1, Ordering::Relaxed);
        self.dispatched_requests
            .fetch_add(count as u64, Ordering::Relaxed);
        self.max_aggregation
            .fetch_max(count as u64, Ordering::Relaxed);
        self.per_policy[policy.index()].fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_release(&self, bytes: u64) {
        self.released.fetch_add(1, Ordering::Relaxed);
        self.released_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for counter in [
            &self.received,
            &self.dispatched_requests,
            &self.dispatched_entries,
            &self.released,
            &self.released_bytes,
            &self.cancelled,
            &self.aggregations,
            &self.max_aggregation,
            &self.migrations,
            &self.lock_retries,
            &self.waits,
            &self.not_found,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        for counter in &self.per_policy {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            received: load(&self.received),
            dispatched_requests: load(&self.dispatched_requests),
            dispatched_entries: load(&self.dispatched_entries),
            released: load(&self.released),
            released_bytes: load(&self.released_bytes),
            cancelled: load(&self.cancelled),
            aggregations: load(&self.aggregations),
            max_aggregation: load(&self.max_aggregation),
            migrations: load(&self.migrations),
            lock_retries: load(&self.lock_retries),
            waits: load(&self.waits),
            not_found: load(&self.not_found),
            per_policy: PolicyKind::ALL
                .iter()
                .map(|k| (k.name().to_string(), load(&self.per_policy[k.index()])))
                .filter(|(_, v)| *v > 0)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub dispatched_requests: u64,
    pub dispatched_entries: u64,
    pub released: u64,
    pub released_bytes: u64,
    pub cancelled: u64,
    pub aggregations: u64,
    pub max_aggregation: u64,
    pub migrations: u64,
    pub lock_retries: u64,
    pub waits: u64,
    pub not_found: u64,
    /// Requests dispatched per policy name.
    pub per_policy: BTreeMap<String, u64>,
}

impl StatsSnapshot {
    pub fn average_aggregation(&self) -> f64 {
        if self.dispatched_entries == 0 {
            0.0
        } else {
            self.dispatched_requests as f64 / self.dispatched_entries as f64
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatsReport {
    pub current_policy: String,
    pub pending_requests: usize,
    pub pending_files: usize,
    pub global: StatsSnapshot,
    pub files: Vec<FileSnapshot>,
}

impl StatsReport {
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_reset() {
        let stats = SchedulerStats::new();
        stats.record_received(false);
        stats.record_received(true);
        stats.record_dispatch(PolicyKind::Mlf, 2);
        stats.record_dispatch(PolicyKind::Mlf, 5);
        stats.record_release(4096);

        let snap = stats.snapshot();
        assert_eq!(snap.received, 2);
        assert_eq!(snap.aggregations, 1);
        assert_eq!(snap.max_aggregation, 5);
        assert_eq!(snap.per_policy.get("MLF"), Some(&7));
        assert!((snap.average_aggregation() - 3.5).abs() < f64::EPSILON);

        stats.reset();
        let snap = stats.snapshot();
        assert_eq!(snap.received, 0);
        assert!(snap.per_policy.is_empty());
    }

    #[test]
    fn test_report_is_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.json");
        let report = StatsReport {
            current_policy: "SJF".to_string(),
            pending_requests: 0,
            pending_files: 0,
            global: StatsSnapshot::default(),
            files: Vec::new(),
        };
        report.write_to(&path).unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["current_policy"], "SJF");
    }
}
