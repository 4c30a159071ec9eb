//! aIOLi: quantum-based, synchronous, FIFO across files.
//!
//! The queue holding the eligible head with the oldest arrival is granted a
//! time quantum and served in a burst until the quantum is spent, the queue
//! empties or the next head is not yet eligible. Each head still goes through
//! the waiting decision, which can end the burst early. The following grant
//! grows or shrinks with how much of the previous one was used.

use crate::access_time::AccessTimeModel;
use crate::config::SchedulerConfig;
use crate::file_queues::FileQueues;
use crate::policy::{waiting, PolicyKind, ScheduleOutcome, SchedulingPolicy};
use crate::request::Direction;
use crate::scheduler::SchedulerCore;
use std::sync::Arc;
use tracing::trace;

/// Next grant from the previous grant and the time actually used under it.
pub fn next_quantum(granted: u64, used: u64, min: u64, max: u64) -> u64 {
    let next = if granted == 0 {
        min
    } else {
        let ratio = used as f64 / granted as f64;
        if ratio >= 1.75 {
            granted.saturating_mul(2)
        } else if ratio >= 1.25 {
            granted.saturating_add(granted / 2)
        } else if ratio >= 0.75 {
            granted
        } else {
            granted / 2
        }
    };
    next.clamp(min, max.max(min))
}

struct Candidate {
    arrival: u64,
    bucket: usize,
    file_id: Arc<str>,
    direction: Direction,
}

pub struct AioliPolicy {
    quantum_bytes: u64,
    min_quantum: u64,
    max_quantum: u64,
}

impl AioliPolicy {
    pub fn new(config: &SchedulerConfig, model: &dyn AccessTimeModel) -> Self {
        let quantum_bytes = config.aioli_quantum_bytes.max(1);
        let min_quantum = model.access_time(quantum_bytes, Direction::Read).max(1);
        let max_quantum = model
            .access_time(
                quantum_bytes.saturating_mul(config.max_aggregation_size.max(1) as u64),
                Direction::Read,
            )
            .max(min_quantum);
        Self {
            quantum_bytes,
            min_quantum,
            max_quantum,
        }
    }

    pub fn quantum_bounds(&self) -> (u64, u64) {
        (self.min_quantum, self.max_quantum)
    }

    /// Oldest eligible head across files outside their cooldown, plus the
    /// smallest remaining cooldown seen.
    fn select(&self, core: &SchedulerCore, now: u64) -> (Option<Candidate>, Option<u64>) {
        let mut best: Option<Candidate> = None;
        let mut smallest_wait: Option<u64> = None;

        for b in 0..core.index().bucket_count() {
            let mut bucket = core.index().lock(b);
            if bucket.pending == 0 {
                continue;
            }
            for fq in bucket.files.iter_mut() {
                if fq.queues.iter().all(|q| q.is_empty()) {
                    continue;
                }
                if let Some(remaining) = fq.cooldown_remaining(now) {
                    smallest_wait = Some(smallest_wait.map_or(remaining, |w| w.min(remaining)));
                    continue;
                }
                for direction in Direction::ALL {
                    let Some(head) = fq.queue_mut(direction).entries.first_mut() else {
                        continue;
                    };
                    head.bump_sched_factor();
                    if !head.is_eligible(self.quantum_bytes) {
                        continue;
                    }
                    let arrival = head.earliest_arrival();
                    if best.as_ref().map_or(true, |c| arrival < c.arrival) {
                        best = Some(Candidate {
                            arrival,
                            bucket: b,
                            file_id: Arc::clone(&fq.file_id),
                            direction,
                        });
                    }
                }
            }
        }
        (best, smallest_wait)
    }

    fn close_burst(&self, fq: &mut FileQueues, direction: Direction) {
        let quantum = &mut fq.queues[direction.index()].quantum;
        quantum.next_quantum =
            next_quantum(quantum.granted, quantum.used, self.min_quantum, self.max_quantum);
        trace!(
            "Quantum for {} {}: used {} of {}, next {}",
            fq.file_id,
            direction.as_str(),
            quantum.used,
            quantum.granted,
            quantum.next_quantum
        );
    }

    /// Serves one queue for the length of a quantum. Returns the number of
    /// entries dispatched and the cooldown armed before the next head, if any.
    fn serve(&self, core: &SchedulerCore, candidate: &Candidate) -> (usize, Option<u64>) {
        let direction = candidate.direction;
        let mut dispatched = 0;
        // Estimated service time of the burst so far.
        let mut consumed = 0u64;

        while !core.is_stopping() {
            let subs = {
                let mut bucket = core.index().lock(candidate.bucket);
                let Some(file_idx) = bucket.position(&candidate.file_id) else {
                    break;
                };
                let now = core.now();
                let fq = &mut bucket.files[file_idx];

                if fq.queue(direction).is_empty() {
                    if dispatched > 0 {
                        self.close_burst(fq, direction);
                    }
                    break;
                }

                if dispatched == 0 {
                    if let Some(wait) = waiting::check_selection(core, fq, direction, 0, now) {
                        return (0, Some(wait));
                    }
                    let quantum = &mut fq.queue_mut(direction).quantum;
                    quantum.granted = if quantum.next_quantum == 0 {
                        self.min_quantum
                    } else {
                        quantum.next_quantum
                    };
                    quantum.used = 0;
                    quantum.granted_at = now;
                } else {
                    let spent = consumed >= fq.queue(direction).quantum.granted;
                    let head = &mut fq.queue_mut(direction).entries[0];
                    head.bump_sched_factor();
                    if spent || !head.is_eligible(self.quantum_bytes) {
                        self.close_burst(fq, direction);
                        break;
                    }
                    // Every head of the burst passes the waiting decision.
                    if let Some(wait) = waiting::check_selection(core, fq, direction, 0, now) {
                        self.close_burst(fq, direction);
                        return (dispatched, Some(wait));
                    }
                }

                core.dispatch_entry(&mut bucket, file_idx, direction, 0, PolicyKind::Aioli, true)
            };
            dispatched += 1;
            consumed = consumed.saturating_add(
                core.access_model()
                    .access_time(subs.iter().map(|r| r.length).sum(), direction),
            );
            core.deliver(&subs, PolicyKind::Aioli);
        }
        (dispatched, None)
    }
}

impl SchedulingPolicy for AioliPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Aioli
    }

    fn schedule(&mut self, core: &SchedulerCore) -> ScheduleOutcome {
        let deadline = core.refresh_deadline();
        let mut outcome = ScheduleOutcome::default();

        while !core.should_yield(deadline) {
            let (candidate, smallest_wait) = self.select(core, core.now());
            let Some(candidate) = candidate else {
                if smallest_wait.is_some() {
                    outcome.wait_ns = smallest_wait;
                    break;
                }
                // Nothing eligible yet: the next scan doubles every head's factor.
                continue;
            };
            let (dispatched, wait) = self.serve(core, &candidate);
            outcome.dispatched += dispatched;
            if dispatched == 0 && wait.is_some() {
                outcome.wait_ns = wait;
                break;
            }
        }
        outcome
    }
}
