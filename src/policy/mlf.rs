//! Multi-level feedback.
//!
//! Every scan doubles the `sched_factor` of every pending entry it passes;
//! an entry becomes eligible once `sched_factor × quantum` covers its length.
//! Small requests therefore go first while large ones are guaranteed to
//! become eligible after a bounded number of scans. Each pass takes at most
//! one entry per queue and moves round-robin over the buckets, skipping a
//! bucket that is busy rather than waiting for it.

use crate::policy::{waiting, PolicyKind, ScheduleOutcome, SchedulingPolicy};
use crate::request::{Direction, SubRequests};
use crate::scheduler::SchedulerCore;

pub struct MlfPolicy {
    quantum: u64,
    cursor: usize,
}

impl MlfPolicy {
    pub fn new(quantum: u64) -> Self {
        Self {
            quantum: quantum.max(1),
            cursor: 0,
        }
    }

    /// One scan of one bucket. Returns the entries to deliver once the bucket
    /// lock is released, and the smallest cooldown met.
    fn scan_bucket(
        &self,
        core: &SchedulerCore,
        b: usize,
        now: u64,
    ) -> (Vec<SubRequests>, Option<u64>) {
        let mut ready = Vec::new();
        let mut smallest_wait: Option<u64> = None;
        let Some(mut bucket) = core.index().try_lock(b) else {
            return (ready, None);
        };
        if bucket.pending == 0 {
            return (ready, None);
        }

        for file_idx in 0..bucket.files.len() {
            for direction in Direction::ALL {
                let fq = &mut bucket.files[file_idx];
                if fq.queue(direction).is_empty() {
                    continue;
                }
                if let Some(remaining) = fq.cooldown_remaining(now) {
                    smallest_wait = Some(smallest_wait.map_or(remaining, |w| w.min(remaining)));
                    continue;
                }

                let mut selected = None;
                for (i, node) in fq.queue_mut(direction).entries.iter_mut().enumerate() {
                    node.bump_sched_factor();
                    if selected.is_none() && node.is_eligible(self.quantum) {
                        selected = Some(i);
                    }
                }
                let Some(idx) = selected else {
                    continue;
                };

                if let Some(wait) = waiting::check_selection(core, fq, direction, idx, now) {
                    smallest_wait = Some(smallest_wait.map_or(wait, |w| w.min(wait)));
                    continue;
                }
                ready.push(core.dispatch_entry(
                    &mut bucket,
                    file_idx,
                    direction,
                    idx,
                    PolicyKind::Mlf,
                    false,
                ));
            }
        }
        (ready, smallest_wait)
    }
}

impl SchedulingPolicy for MlfPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Mlf
    }

    fn schedule(&mut self, core: &SchedulerCore) -> ScheduleOutcome {
        let deadline = core.refresh_deadline();
        let buckets = core.index().bucket_count();
        let mut outcome = ScheduleOutcome::default();

        while !core.should_yield(deadline) {
            let mut dispatched = 0;
            let mut smallest_wait: Option<u64> = None;

            for step in 0..buckets {
                let b = (self.cursor + step) % buckets;
                let (ready, wait) = self.scan_bucket(core, b, core.now());
                if let Some(wait) = wait {
                    smallest_wait = Some(smallest_wait.map_or(wait, |w| w.min(wait)));
                }
                for subs in &ready {
                    core.deliver(subs, PolicyKind::Mlf);
                }
                dispatched += ready.len();
            }
            self.cursor = (self.cursor + 1) % buckets;
            outcome.dispatched += dispatched;

            if dispatched == 0 && smallest_wait.is_some() {
                outcome.wait_ns = smallest_wait;
                break;
            }
        }
        outcome
    }
}
