//! Access-time estimation.
//!
//! aIOLi sizes its quanta in time, so it needs an estimate of how long a
//! request of a given size takes. Deployments with a measured profile plug
//! their own model in; the default is a latency-plus-throughput line.

use crate::config::SchedulerConfig;
use crate::request::Direction;

pub trait AccessTimeModel: Send + Sync {
    /// Estimated service time of `length` bytes, in nanoseconds.
    fn access_time(&self, length: u64, direction: Direction) -> u64;
}

#[derive(Debug, Clone, Copy)]
pub struct LinearAccessModel {
    pub latency_ns: u64,
    pub ns_per_byte: f64,
}

impl LinearAccessModel {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            latency_ns: config.access_latency_ns,
            ns_per_byte: config.access_ns_per_byte,
        }
    }
}

impl AccessTimeModel for LinearAccessModel {
    fn access_time(&self, length: u64, _direction: Direction) -> u64 {
        self.latency_ns
            .saturating_add((length as f64 * self.ns_per_byte) as u64)
    }
}
