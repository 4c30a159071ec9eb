//! Timeline policies: TO, TO-agg and TW.
//!
//! The ordering itself lives in the timeline, configured by migration for
//! whichever of the three is active, so all three dispatch the same way:
//! pop the head, hand it out, repeat.

use crate::policy::{PolicyKind, ScheduleOutcome, SchedulingPolicy};
use crate::scheduler::SchedulerCore;

pub struct TimeOrderPolicy {
    kind: PolicyKind,
}

impl TimeOrderPolicy {
    pub fn new(kind: PolicyKind) -> Self {
        debug_assert!(!kind.descriptor().needs_hashtable);
        Self { kind }
    }
}

impl SchedulingPolicy for TimeOrderPolicy {
    fn kind(&self) -> PolicyKind {
        self.kind
    }

    fn schedule(&mut self, core: &SchedulerCore) -> ScheduleOutcome {
        let deadline = core.refresh_deadline();
        let mut outcome = ScheduleOutcome::default();

        while !core.should_yield(deadline) {
            let Some(subs) = core.dispatch_timeline_head(self.kind) else {
                break;
            };
            core.deliver(&subs, self.kind);
            outcome.dispatched += 1;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::request::Direction;
    use crate::scheduler::test_support::{config_with, recording_core};

    #[test]
    fn test_fifo_ignores_offsets() {
        let (core, seen) = recording_core(config_with(PolicyKind::TimeOrder));
        core.submit("f", Direction::Read, 100, 100, 1, 0).unwrap();
        core.submit("f", Direction::Read, 0, 100, 2, 0).unwrap();
        core.submit("g", Direction::Read, 0, 100, 3, 0).unwrap();
        assert_eq!(core.timeline().lock().len(), 3);

        TimeOrderPolicy::new(PolicyKind::TimeOrder).schedule(&core);
        let tokens: Vec<u64> = seen.lock().iter().map(|r| r.token).collect();
        assert_eq!(tokens, vec![1, 2, 3]);
        assert_eq!(core.counters().files(), 0);
    }

    #[test]
    fn test_aggregating_variant_merges_same_file() {
        let (core, seen) = recording_core(config_with(PolicyKind::TimeOrderAggregation));
        core.submit("f", Direction::Write, 0, 100, 1, 0).unwrap();
        core.submit("g", Direction::Write, 0, 100, 2, 0).unwrap();
        core.submit("f", Direction::Write, 100, 100, 3, 0).unwrap();
        assert_eq!(core.timeline().lock().len(), 2);
        assert_eq!(core.counters().requests(), 3);

        let outcome = TimeOrderPolicy::new(PolicyKind::TimeOrderAggregation).schedule(&core);
        assert_eq!(outcome.dispatched, 2);
        let tokens: Vec<u64> = seen.lock().iter().map(|r| r.token).collect();
        assert_eq!(tokens, vec![1, 3, 2]);
    }

    #[test]
    fn test_time_window_orders_by_stream_within_window() {
        let config = SchedulerConfig {
            time_window_ns: u64::MAX / 4,
            ..config_with(PolicyKind::TimeWindow)
        };
        let (core, seen) = recording_core(config);
        core.submit("f", Direction::Read, 0, 10, 1, 5).unwrap();
        core.submit("g", Direction::Read, 0, 10, 2, 2).unwrap();
        core.submit("h", Direction::Read, 0, 10, 3, 9).unwrap();

        TimeOrderPolicy::new(PolicyKind::TimeWindow).schedule(&core);
        let tokens: Vec<u64> = seen.lock().iter().map(|r| r.token).collect();
        assert_eq!(tokens, vec![2, 1, 3]);
    }
}
