//! Pass-through policy.
//!
//! Admission hands requests straight to the callback while NOOP is active,
//! so the only work left here is draining entries queued before the switch.

use crate::policy::{PolicyKind, ScheduleOutcome, SchedulingPolicy};
use crate::request::Direction;
use crate::scheduler::SchedulerCore;

pub struct NoopPolicy;

impl SchedulingPolicy for NoopPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Noop
    }

    fn schedule(&mut self, core: &SchedulerCore) -> ScheduleOutcome {
        let mut outcome = ScheduleOutcome::default();
        for b in 0..core.index().bucket_count() {
            let mut ready = Vec::new();
            {
                let mut bucket = core.index().lock(b);
                if bucket.pending == 0 {
                    continue;
                }
                for file_idx in 0..bucket.files.len() {
                    for direction in Direction::ALL {
                        while !bucket.files[file_idx].queue(direction).is_empty() {
                            ready.push(core.dispatch_entry(
                                &mut bucket,
                                file_idx,
                                direction,
                                0,
                                PolicyKind::Noop,
                                false,
                            ));
                        }
                    }
                }
            }
            for subs in &ready {
                core.deliver(subs, PolicyKind::Noop);
            }
            outcome.dispatched += ready.len();
        }
        outcome
    }
}
