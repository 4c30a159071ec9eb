//! Per-policy bandwidth measurement for the meta-policies.
//!
//! Each reselection period contributes one sample (bytes released over the
//! period). A policy's bandwidth is the byte-weighted average over its
//! samples that are still inside the validity window.

use crate::policy::PolicyKind;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy)]
struct Sample {
    bytes: u64,
    elapsed_ns: u64,
    taken_at: u64,
}

#[derive(Debug)]
pub struct BandwidthTracker {
    validity_ns: u64,
    samples: [VecDeque<Sample>; PolicyKind::COUNT],
}

impl BandwidthTracker {
    pub fn new(validity_ns: u64) -> Self {
        Self {
            validity_ns,
            samples: std::array::from_fn(|_| VecDeque::new()),
        }
    }

    pub fn record(&mut self, kind: PolicyKind, bytes: u64, elapsed_ns: u64, now: u64) {
        if elapsed_ns == 0 {
            return;
        }
        let samples = &mut self.samples[kind.index()];
        samples.push_back(Sample {
            bytes,
            elapsed_ns,
            taken_at: now,
        });
        let validity = self.validity_ns;
        while samples
            .front()
            .is_some_and(|s| now.saturating_sub(s.taken_at) > validity)
        {
            samples.pop_front();
        }
    }

    /// Bytes per second over the valid samples, `None` when there are none.
    pub fn bandwidth(&self, kind: PolicyKind, now: u64) -> Option<f64> {
        let (bytes, elapsed) = self.samples[kind.index()]
            .iter()
            .filter(|s| now.saturating_sub(s.taken_at) <= self.validity_ns)
            .fold((0u64, 0u64), |(b, e), s| {
                (b.saturating_add(s.bytes), e.saturating_add(s.elapsed_ns))
            });
        if elapsed == 0 {
            None
        } else {
            Some(bytes as f64 * 1e9 / elapsed as f64)
        }
    }

    pub fn has_measurement(&self, kind: PolicyKind, now: u64) -> bool {
        self.bandwidth(kind, now).is_some()
    }
}
