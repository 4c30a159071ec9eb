//! Meta-policies that periodically choose the active scheduling policy.
//!
//! [`ArmedBandit`] explores every candidate once, then draws the next policy
//! with probability proportional to its measured bandwidth, never letting a
//! candidate's probability fall below a configured floor.
//! [`DecisionTree`] observes the workload for one period and then commits to
//! whatever its [`PolicySelector`] picks.

use crate::bandwidth::BandwidthTracker;
use crate::config::SchedulerConfig;
use crate::policy::PolicyKind;
use crate::scheduler::SchedulerCore;
use crate::stats::StatsReport;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info};

pub trait MetaPolicy: Send {
    fn kind(&self) -> PolicyKind;

    /// Policy to run before any measurement exists.
    fn select_initial(&mut self, core: &SchedulerCore) -> PolicyKind;

    /// Policy to run for the next period.
    fn select_next(
        &mut self,
        core: &SchedulerCore,
        bandwidth: &BandwidthTracker,
        current: PolicyKind,
    ) -> PolicyKind;
}

pub fn build(kind: PolicyKind, config: &SchedulerConfig) -> Box<dyn MetaPolicy> {
    match kind {
        PolicyKind::DynTree => Box::new(DecisionTree::new(config, Box::new(StaticRules))),
        _ => Box::new(ArmedBandit::new(config)),
    }
}

/// Policies a meta-policy may switch to.
pub fn candidates() -> Vec<PolicyKind> {
    PolicyKind::ALL
        .into_iter()
        .filter(|k| {
            let d = k.descriptor();
            d.can_be_dynamically_selected && !d.is_dynamic
        })
        .collect()
}

/// Turns bandwidths into integer percentages summing to 100, each at least
/// `floor` (lowered to `100 / n` when `n` floors would not fit). The
/// rounding remainder goes to the fastest candidate.
pub fn normalize_probabilities(bandwidths: &[f64], floor: u32) -> Vec<u32> {
    let n = bandwidths.len() as u32;
    if n == 0 {
        return Vec::new();
    }
    let floor = if floor.saturating_mul(n) > 100 { 100 / n } else { floor };
    let spare = 100 - floor * n;
    let total: f64 = bandwidths.iter().map(|b| b.max(0.0)).sum();

    let mut probabilities: Vec<u32> = bandwidths
        .iter()
        .map(|b| {
            let share = if total > 0.0 {
                (b.max(0.0) / total * spare as f64).floor() as u32
            } else {
                spare / n
            };
            floor + share
        })
        .collect();

    let assigned: u32 = probabilities.iter().sum();
    let best = bandwidths
        .iter()
        .enumerate()
        .fold(0, |best, (i, b)| if *b > bandwidths[best] { i } else { best });
    probabilities[best] += 100u32.saturating_sub(assigned);
    probabilities
}

pub struct ArmedBandit {
    candidates: Vec<PolicyKind>,
    min_probability: u32,
    default: PolicyKind,
    probabilities: Vec<u32>,
    rng: StdRng,
}

impl ArmedBandit {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    pub fn with_seed(config: &SchedulerConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &SchedulerConfig, rng: StdRng) -> Self {
        let candidates = candidates();
        let n = candidates.len();
        Self {
            probabilities: normalize_probabilities(&vec![0.0; n], config.min_selection_probability),
            candidates,
            min_probability: config.min_selection_probability,
            default: config.default_policy_kind(),
            rng,
        }
    }

    pub fn candidates(&self) -> &[PolicyKind] {
        &self.candidates
    }

    pub fn probabilities(&self) -> &[u32] {
        &self.probabilities
    }

    fn draw(&mut self) -> PolicyKind {
        let roll = self.rng.random_range(0..100u32);
        let mut cumulative = 0;
        for (kind, p) in self.candidates.iter().zip(&self.probabilities) {
            cumulative += p;
            if roll < cumulative {
                return *kind;
            }
        }
        self.candidates.last().copied().unwrap_or(self.default)
    }

    /// Picks from measured bandwidths at `now`.
    pub fn choose(&mut self, bandwidth: &BandwidthTracker, now: u64) -> PolicyKind {
        if let Some(untried) = self
            .candidates
            .iter()
            .copied()
            .find(|k| !bandwidth.has_measurement(*k, now))
        {
            debug!("Armed bandit exploring {}", untried.name());
            return untried;
        }

        let bandwidths: Vec<f64> = self
            .candidates
            .iter()
            .map(|k| bandwidth.bandwidth(*k, now).unwrap_or(0.0))
            .collect();
        self.probabilities = normalize_probabilities(&bandwidths, self.min_probability);
        self.draw()
    }
}

impl MetaPolicy for ArmedBandit {
    fn kind(&self) -> PolicyKind {
        PolicyKind::ArmedBandit
    }

    fn select_initial(&mut self, _core: &SchedulerCore) -> PolicyKind {
        if self.candidates.contains(&self.default) {
            self.default
        } else {
            self.candidates.first().copied().unwrap_or(self.default)
        }
    }

    fn select_next(
        &mut self,
        core: &SchedulerCore,
        bandwidth: &BandwidthTracker,
        _current: PolicyKind,
    ) -> PolicyKind {
        self.choose(bandwidth, core.now())
    }
}

/// Workload summary a [`PolicySelector`] decides from.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AccessPattern {
    pub files: usize,
    pub requests: u64,
    pub read_fraction: f64,
    /// Fraction of dispatched requests folded into another by aggregation.
    pub aggregated_fraction: f64,
    pub mean_request_size: f64,
}

impl AccessPattern {
    pub fn from_report(report: &StatsReport) -> Self {
        let mut reads = 0u64;
        let mut requests = 0u64;
        let mut entries = 0u64;
        let mut dispatched = 0u64;
        let mut files = 0usize;
        for file in &report.files {
            let total = file.read_aggregation.dispatched_requests
                + file.write_aggregation.dispatched_requests
                + (file.pending_reads + file.pending_writes + file.timeline_pending) as u64;
            if total == 0 {
                continue;
            }
            files += 1;
            reads += file.read_aggregation.dispatched_requests + file.pending_reads as u64;
            requests += total;
            entries += file.read_aggregation.dispatched_entries
                + file.write_aggregation.dispatched_entries;
            dispatched += file.read_aggregation.dispatched_requests
                + file.write_aggregation.dispatched_requests;
        }

        let global = &report.global;
        Self {
            files,
            requests,
            read_fraction: ratio(reads, requests),
            aggregated_fraction: ratio(dispatched.saturating_sub(entries), dispatched),
            mean_request_size: if global.released == 0 {
                0.0
            } else {
                global.released_bytes as f64 / global.released as f64
            },
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

pub trait PolicySelector: Send {
    fn select(&self, pattern: &AccessPattern) -> PolicyKind;
}

/// Built-in rules used when no trained selector is supplied.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticRules;

const SMALL_REQUEST: f64 = 64.0 * 1024.0;

impl PolicySelector for StaticRules {
    fn select(&self, pattern: &AccessPattern) -> PolicyKind {
        if pattern.files <= 1 {
            if pattern.aggregated_fraction >= 0.5 {
                PolicyKind::TimeOrderAggregation
            } else {
                PolicyKind::TimeOrder
            }
        } else if pattern.aggregated_fraction >= 0.5 {
            PolicyKind::Aioli
        } else if pattern.mean_request_size < SMALL_REQUEST {
            PolicyKind::Mlf
        } else {
            PolicyKind::Sjf
        }
    }
}

pub struct DecisionTree {
    selector: Box<dyn PolicySelector>,
    default: PolicyKind,
    chosen: Option<PolicyKind>,
}

impl DecisionTree {
    pub fn new(config: &SchedulerConfig, selector: Box<dyn PolicySelector>) -> Self {
        Self {
            selector,
            default: config.default_policy_kind(),
            chosen: None,
        }
    }

    pub fn chosen(&self) -> Option<PolicyKind> {
        self.chosen
    }

    /// Commits to a policy on the first call; later calls repeat it.
    pub fn decide(&mut self, pattern: &AccessPattern) -> PolicyKind {
        if let Some(kind) = self.chosen {
            return kind;
        }
        let kind = self.selector.select(pattern);
        info!("Decision tree chose {} for {:?}", kind.name(), pattern);
        self.chosen = Some(kind);
        kind
    }
}

impl MetaPolicy for DecisionTree {
    fn kind(&self) -> PolicyKind {
        PolicyKind::DynTree
    }

    fn select_initial(&mut self, _core: &SchedulerCore) -> PolicyKind {
        self.chosen.unwrap_or(self.default)
    }

    fn select_next(
        &mut self,
        core: &SchedulerCore,
        _bandwidth: &BandwidthTracker,
        _current: PolicyKind,
    ) -> PolicyKind {
        if let Some(kind) = self.chosen {
            return kind;
        }
        let pattern = AccessPattern::from_report(&core.report());
        self.decide(&pattern)
    }
}
