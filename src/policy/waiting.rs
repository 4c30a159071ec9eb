//! Cooldown decision shared by the quantum-based policies.
//!
//! Before a selected entry is dispatched, the file may be put to sleep for a
//! short while if a better aggregation looks imminent. Triggers are checked
//! in priority order and at most one fires. A file never waits twice for the
//! same entry.

use crate::file_queues::FileQueues;
use crate::request::{Direction, RequestNode};
use crate::scheduler::SchedulerCore;
use std::sync::atomic::Ordering;
use tracing::debug;

/// Estimates how long it is worth holding back an entry because a larger
/// aggregation is expected to form.
pub trait AggregationPredictor: Send + Sync {
    fn predicted_wait(
        &self,
        file_id: &str,
        direction: Direction,
        node: &RequestNode,
        now: u64,
    ) -> Option<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    Shift,
    BetterAggregation,
    Predicted,
}

/// Decides whether entry `idx` of `direction` should be held back. Arms the
/// file's cooldown and returns its length when it should.
pub fn check_selection(
    core: &SchedulerCore,
    fq: &mut FileQueues,
    direction: Direction,
    idx: usize,
    now: u64,
) -> Option<u64> {
    let config = core.config();
    let queue = fq.queue(direction);
    let node = queue.entries.get(idx)?;
    let seq = node.first_seq();
    if fq.waited_seq == Some(seq) {
        return None;
    }

    let shift = queue.shift;
    let (wait, reason) = if shift.has_history
        && node.offset() > shift.last_end
        && node.offset() <= shift.predicted_offset
    {
        (config.shift_wait_ns, WaitReason::Shift)
    } else if node.count() < queue.aggregation.best && node.end() > shift.last_end {
        (config.aggregation_wait_ns, WaitReason::BetterAggregation)
    } else if config.trace_predict {
        let predicted = core
            .predictor()
            .and_then(|p| p.predicted_wait(&fq.file_id, direction, node, now))?;
        (
            predicted.min(config.max_predicted_wait_ns),
            WaitReason::Predicted,
        )
    } else {
        return None;
    };

    if wait == 0 {
        return None;
    }
    fq.waiting_until = Some(now.saturating_add(wait));
    fq.waited_seq = Some(seq);
    core.stats().waits.fetch_add(1, Ordering::Relaxed);
    debug!(
        "Holding back {} {} for {}ns ({:?})",
        fq.file_id,
        direction.as_str(),
        wait,
        reason
    );
    Some(wait)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::file_queues::PendingCounters;
    use crate::policy::PolicyKind;
    use crate::request::test_request;
    use crate::scheduler::test_support::{config_with, recording_core};
    use std::sync::Arc;

    struct FixedPredictor(u64);

    impl AggregationPredictor for FixedPredictor {
        fn predicted_wait(&self, _: &str, _: Direction, _: &RequestNode, _: u64) -> Option<u64> {
            Some(self.0)
        }
    }

    fn file_with(offsets: &[u64]) -> FileQueues {
        let counters = PendingCounters::new();
        let mut fq = FileQueues::new(Arc::from("f"));
        for &off in offsets {
            fq.insert(test_request("f", Direction::Read, off, 100).into(), 1, 0, &counters);
        }
        fq
    }

    #[test]
    fn test_no_history_no_wait() {
        let (core, _) = recording_core(config_with(PolicyKind::Aioli));
        let mut fq = file_with(&[0]);
        assert_eq!(check_selection(&core, &mut fq, Direction::Read, 0, 10), None);
        assert!(fq.waiting_until.is_none());
    }

    #[test]
    fn test_shift_wait_fires_once() {
        let (core, _) = recording_core(config_with(PolicyKind::Aioli));
        let mut fq = file_with(&[250]);
        fq.queue_mut(Direction::Read).shift = crate::file_queues::ShiftState {
            has_history: true,
            last_end: 200,
            predicted_offset: 300,
        };

        let wait = check_selection(&core, &mut fq, Direction::Read, 0, 1_000);
        assert_eq!(wait, Some(core.config().shift_wait_ns));
        assert_eq!(fq.waiting_until, Some(1_000 + core.config().shift_wait_ns));
        assert_eq!(check_selection(&core, &mut fq, Direction::Read, 0, 2_000), None);
        assert_eq!(core.stats().snapshot().waits, 1);
    }

    #[test]
    fn test_better_aggregation_wait() {
        let (core, _) = recording_core(config_with(PolicyKind::Mlf));
        let mut fq = file_with(&[1_000]);
        fq.queue_mut(Direction::Read).aggregation.best = 4;
        let wait = check_selection(&core, &mut fq, Direction::Read, 0, 0);
        assert_eq!(wait, Some(core.config().aggregation_wait_ns));
    }

    #[test]
    fn test_predictor_is_capped() {
        let config = SchedulerConfig {
            trace_predict: true,
            max_predicted_wait_ns: 500,
            ..config_with(PolicyKind::Aioli)
        };
        let (core, _) = recording_core(config);
        let core = Arc::try_unwrap(core)
            .ok()
            .unwrap()
            .with_predictor(Arc::new(FixedPredictor(10_000)));
        let mut fq = file_with(&[0]);
        assert_eq!(check_selection(&core, &mut fq, Direction::Read, 0, 0), Some(500));
    }
}
