//! Scheduling policies.
//!
//! Each policy is described by a static [`PolicyDescriptor`] and implemented
//! by a [`SchedulingPolicy`] that selects and dispatches requests from the
//! index its descriptor asks for.

pub mod aioli;
pub mod mlf;
pub mod noop;
pub mod sjf;
pub mod time_order;
pub mod waiting;

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::scheduler::SchedulerCore;
use crate::timeline::TimelineOrder;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

pub use aioli::AioliPolicy;
pub use mlf::MlfPolicy;
pub use noop::NoopPolicy;
pub use sjf::SjfPolicy;
pub use time_order::TimeOrderPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PolicyKind {
    Aioli,
    Mlf,
    Sjf,
    Srtf,
    TimeOrder,
    TimeOrderAggregation,
    TimeWindow,
    Noop,
    ArmedBandit,
    DynTree,
}

impl PolicyKind {
    pub const COUNT: usize = 10;

    pub const ALL: [PolicyKind; PolicyKind::COUNT] = [
        PolicyKind::Aioli,
        PolicyKind::Mlf,
        PolicyKind::Sjf,
        PolicyKind::Srtf,
        PolicyKind::TimeOrder,
        PolicyKind::TimeOrderAggregation,
        PolicyKind::TimeWindow,
        PolicyKind::Noop,
        PolicyKind::ArmedBandit,
        PolicyKind::DynTree,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn descriptor(self) -> &'static PolicyDescriptor {
        &DESCRIPTORS[self.index()]
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }

    /// Case-insensitive lookup by descriptor name.
    pub fn from_name(name: &str) -> Result<Self> {
        DESCRIPTORS
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(name.trim()))
            .map(|d| d.kind)
            .ok_or_else(|| Error::UnknownPolicy(name.to_string()))
    }
}

/// Static, immutable policy metadata.
#[derive(Debug)]
pub struct PolicyDescriptor {
    pub kind: PolicyKind,
    pub name: &'static str,
    /// Bucketed index when true, timeline otherwise.
    pub needs_hashtable: bool,
    /// The core waits for release after every dispatch.
    pub synchronous: bool,
    /// Sub-requests per aggregate; 1 disables aggregation.
    pub max_aggregation: usize,
    pub can_be_dynamically_selected: bool,
    /// Meta-policy that periodically picks another policy.
    pub is_dynamic: bool,
}

const fn descriptor(
    kind: PolicyKind,
    name: &'static str,
    needs_hashtable: bool,
    synchronous: bool,
    max_aggregation: usize,
    can_be_dynamically_selected: bool,
    is_dynamic: bool,
) -> PolicyDescriptor {
    PolicyDescriptor {
        kind,
        name,
        needs_hashtable,
        synchronous,
        max_aggregation,
        can_be_dynamically_selected,
        is_dynamic,
    }
}

pub const MAX_AGGREGATION: usize = 16;

static DESCRIPTORS: [PolicyDescriptor; PolicyKind::COUNT] = [
    descriptor(PolicyKind::Aioli, "AIOLI", true, true, MAX_AGGREGATION, true, false),
    descriptor(PolicyKind::Mlf, "MLF", true, false, MAX_AGGREGATION, true, false),
    descriptor(PolicyKind::Sjf, "SJF", true, false, MAX_AGGREGATION, true, false),
    descriptor(PolicyKind::Srtf, "SRTF", true, false, MAX_AGGREGATION, true, false),
    descriptor(PolicyKind::TimeOrder, "TO", false, false, 1, true, false),
    descriptor(
        PolicyKind::TimeOrderAggregation,
        "TO_AGG",
        false,
        false,
        MAX_AGGREGATION,
        true,
        false,
    ),
    descriptor(PolicyKind::TimeWindow, "TW", false, false, 1, false, false),
    descriptor(PolicyKind::Noop, "NOOP", true, false, 1, true, false),
    descriptor(PolicyKind::ArmedBandit, "ARMED_BANDIT", true, false, 1, false, true),
    descriptor(PolicyKind::DynTree, "DYN_TREE", true, false, 1, false, true),
];

impl PolicyDescriptor {
    /// Aggregation ceiling after applying the configured cap.
    pub fn effective_max_aggregation(&self, config: &SchedulerConfig) -> usize {
        self.max_aggregation.min(config.max_aggregation_size).max(1)
    }

    /// Timeline ordering served while this policy is active.
    pub fn timeline_order(&self, config: &SchedulerConfig, max_stream_id: u32) -> TimelineOrder {
        match self.kind {
            PolicyKind::TimeOrderAggregation => TimelineOrder::FifoAggregate,
            PolicyKind::TimeWindow => TimelineOrder::TimeWindow {
                window_ns: config.time_window_ns.max(1),
                streams: max_stream_id.max(1) as u64,
            },
            _ => TimelineOrder::Fifo,
        }
    }
}

/// The active (non-meta) policy together with a migration epoch.
///
/// Both live in one atomic word so a reader always sees a consistent pair.
/// Migration stores a new value only while holding every index lock, so a
/// thread that holds any one of those locks and still sees the epoch it read
/// before locking knows the policy cannot change under it.
#[derive(Debug)]
pub struct ActivePolicy {
    packed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicySnapshot {
    pub epoch: u64,
    pub kind: PolicyKind,
}

impl ActivePolicy {
    pub fn new(kind: PolicyKind) -> Self {
        Self {
            packed: AtomicU64::new(kind.index() as u64),
        }
    }

    pub fn snapshot(&self) -> PolicySnapshot {
        let packed = self.packed.load(Ordering::Acquire);
        PolicySnapshot {
            epoch: packed >> 8,
            kind: PolicyKind::from_index((packed & 0xff) as usize).unwrap_or(PolicyKind::Noop),
        }
    }

    pub fn kind(&self) -> PolicyKind {
        self.snapshot().kind
    }

    pub fn epoch(&self) -> u64 {
        self.snapshot().epoch
    }

    /// Installs `kind` under a new epoch. Caller holds every index lock.
    pub(crate) fn advance(&self, kind: PolicyKind) -> PolicySnapshot {
        let next = self.epoch() + 1;
        self.packed
            .store((next << 8) | kind.index() as u64, Ordering::Release);
        PolicySnapshot { epoch: next, kind }
    }
}

/// Result of one `schedule()` call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleOutcome {
    /// Entries dispatched.
    pub dispatched: usize,
    /// When nothing was dispatchable: how long until a cooldown expires.
    pub wait_ns: Option<u64>,
}

pub trait SchedulingPolicy: Send {
    fn kind(&self) -> PolicyKind;

    fn init(&mut self, _core: &SchedulerCore) {}

    fn exit(&mut self, _core: &SchedulerCore) {}

    /// Selects and dispatches until nothing is pending, nothing is eligible,
    /// the refresh deadline passes, or the core is stopping.
    fn schedule(&mut self, core: &SchedulerCore) -> ScheduleOutcome;
}

/// Builds the policy object for a non-meta policy.
pub fn build(kind: PolicyKind, core: &SchedulerCore) -> Box<dyn SchedulingPolicy> {
    let config = core.config();
    match kind {
        PolicyKind::Aioli => Box::new(AioliPolicy::new(config, core.access_model())),
        PolicyKind::Mlf => Box::new(MlfPolicy::new(config.mlf_quantum_bytes)),
        PolicyKind::Sjf => Box::new(SjfPolicy::sjf()),
        PolicyKind::Srtf => Box::new(SjfPolicy::srtf()),
        PolicyKind::TimeOrder | PolicyKind::TimeOrderAggregation | PolicyKind::TimeWindow => {
            Box::new(TimeOrderPolicy::new(kind))
        }
        PolicyKind::Noop | PolicyKind::ArmedBandit | PolicyKind::DynTree => Box::new(NoopPolicy),
    }
}
