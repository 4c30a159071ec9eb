//! Shortest job first and shortest remaining time first.
//!
//! Both pick, across every file, the queue with the smallest predicted
//! remaining size. SJF then serves the entries that queue held when it was
//! chosen; SRTF chooses again after every dispatch.

use crate::policy::{PolicyKind, ScheduleOutcome, SchedulingPolicy};
use crate::request::Direction;
use crate::scheduler::SchedulerCore;
use std::sync::Arc;

pub(crate) struct Choice {
    pub(crate) score: u64,
    pub(crate) bucket: usize,
    pub(crate) file_id: Arc<str>,
    pub(crate) direction: Direction,
    pub(crate) entries: usize,
}

pub struct SjfPolicy {
    kind: PolicyKind,
}

impl SjfPolicy {
    pub fn sjf() -> Self {
        Self {
            kind: PolicyKind::Sjf,
        }
    }

    pub fn srtf() -> Self {
        Self {
            kind: PolicyKind::Srtf,
        }
    }

    /// Queue with the smallest predicted remaining size; ties go to the
    /// first one scanned.
    pub(crate) fn select(core: &SchedulerCore) -> Option<Choice> {
        let mut best: Option<Choice> = None;
        for b in 0..core.index().bucket_count() {
            let bucket = core.index().lock(b);
            if bucket.pending == 0 {
                continue;
            }
            for fq in &bucket.files {
                for direction in Direction::ALL {
                    let queue = fq.queue(direction);
                    if queue.is_empty() {
                        continue;
                    }
                    let score = queue.predicted_remaining();
                    if best.as_ref().map_or(true, |c| score < c.score) {
                        best = Some(Choice {
                            score,
                            bucket: b,
                            file_id: Arc::clone(&fq.file_id),
                            direction,
                            entries: queue.entries.len(),
                        });
                    }
                }
            }
        }
        best
    }
}

impl SchedulingPolicy for SjfPolicy {
    fn kind(&self) -> PolicyKind {
        self.kind
    }

    fn schedule(&mut self, core: &SchedulerCore) -> ScheduleOutcome {
        let deadline = core.refresh_deadline();
        let mut outcome = ScheduleOutcome::default();

        while !core.should_yield(deadline) {
            let Some(choice) = Self::select(core) else {
                break;
            };
            let batch = if self.kind == PolicyKind::Srtf {
                1
            } else {
                choice.entries
            };

            for _ in 0..batch {
                let subs = {
                    let mut bucket = core.index().lock(choice.bucket);
                    let Some(file_idx) = bucket.position(&choice.file_id) else {
                        break;
                    };
                    if bucket.files[file_idx].queue(choice.direction).is_empty() {
                        break;
                    }
                    let direction = choice.direction;
                    core.dispatch_entry(&mut bucket, file_idx, direction, 0, self.kind, false)
                };
                core.deliver(&subs, self.kind);
                outcome.dispatched += 1;
                if core.is_stopping() {
                    break;
                }
            }
        }
        outcome
    }
}
