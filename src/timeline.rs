//! Arrival-ordered index used by policies whose ordering crosses files.
//!
//! A single mutex guards the whole queue. The queue always serves the
//! currently active policy: its ordering is switched by migration, under the
//! same lock, never per call.

use crate::aggregation::{self, InsertOutcome};
use crate::request::{Direction, Request, RequestNode};
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineOrder {
    /// Strict arrival order, no aggregation.
    Fifo,
    /// Arrival order; new requests aggregate with any same-file,
    /// same-direction entry they touch.
    FifoAggregate,
    /// Priority = `(arrival / window_ns) × streams + stream_id`.
    TimeWindow { window_ns: u64, streams: u64 },
}

impl TimelineOrder {
    pub fn is_priority(&self) -> bool {
        matches!(self, TimelineOrder::TimeWindow { .. })
    }
}

#[derive(Debug, Clone)]
pub struct TimelineEntry {
    pub node: RequestNode,
    pub priority: u64,
}

pub struct TimelineQueue {
    entries: VecDeque<TimelineEntry>,
    order: TimelineOrder,
    max_aggregation: usize,
    requests: usize,
}

impl TimelineQueue {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            order: TimelineOrder::Fifo,
            max_aggregation: 1,
            requests: 0,
        }
    }

    pub fn order(&self) -> TimelineOrder {
        self.order
    }

    /// Switches the ordering served. Callers reorder afterwards if needed.
    pub fn configure(&mut self, order: TimelineOrder, max_aggregation: usize) {
        self.order = order;
        self.max_aggregation = max_aggregation.max(1);
    }

    fn priority(&self, node: &RequestNode) -> u64 {
        match self.order {
            TimelineOrder::TimeWindow { window_ns, streams } => (node.earliest_arrival()
                / window_ns.max(1))
            .saturating_mul(streams.max(1))
            .saturating_add(node.stream_id() as u64),
            _ => node.first_seq(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Real requests held, counting every sub-request.
    pub fn requests(&self) -> usize {
        self.requests
    }

    pub fn add(&mut self, node: RequestNode) -> InsertOutcome {
        self.requests += node.count();
        match self.order {
            TimelineOrder::Fifo => {
                let priority = self.priority(&node);
                self.entries.push_back(TimelineEntry { node, priority });
                InsertOutcome::Standalone
            }
            TimelineOrder::FifoAggregate => self.add_aggregating(node),
            TimelineOrder::TimeWindow { .. } => {
                let priority = self.priority(&node);
                let idx = self.entries.partition_point(|e| e.priority <= priority);
                self.entries.insert(idx, TimelineEntry { node, priority });
                InsertOutcome::Standalone
            }
        }
    }

    fn find_partner(&self, skip: Option<usize>, node: &RequestNode) -> Option<usize> {
        self.entries.iter().enumerate().position(|(i, e)| {
            Some(i) != skip
                && e.node.file_id() == node.file_id()
                && e.node.direction() == node.direction()
                && e.node.touches(node.offset(), node.end())
                && e.node.count() + node.count() <= self.max_aggregation
        })
    }

    fn add_aggregating(&mut self, node: RequestNode) -> InsertOutcome {
        let Some(mut idx) = self.find_partner(None, &node) else {
            let priority = self.priority(&node);
            self.entries.push_back(TimelineEntry { node, priority });
            return InsertOutcome::Standalone;
        };
        aggregation::absorb(&mut self.entries[idx].node, node);

        // The grown entry may now bridge to further entries of the same file.
        while let Some(other) = self.find_partner(Some(idx), &self.entries[idx].node) {
            let (keep, gone) = if other < idx { (other, idx) } else { (idx, other) };
            let Some(removed) = self.entries.remove(gone) else {
                break;
            };
            aggregation::absorb(&mut self.entries[keep].node, removed.node);
            idx = keep;
        }

        let priority = self.priority(&self.entries[idx].node);
        self.entries[idx].priority = priority;
        InsertOutcome::Aggregated {
            count: self.entries[idx].node.count(),
        }
    }

    pub fn pop_oldest(&mut self) -> Option<RequestNode> {
        let entry = self.entries.pop_front()?;
        self.requests -= entry.node.count();
        Some(entry.node)
    }

    pub fn peek_oldest(&self) -> Option<&RequestNode> {
        self.entries.front().map(|e| &e.node)
    }

    /// Rebuilds the ordering from scratch under the current ordering.
    pub fn reorder(&mut self) {
        let mut entries: Vec<TimelineEntry> = self.entries.drain(..).collect();
        for entry in entries.iter_mut() {
            entry.priority = self.priority(&entry.node);
        }
        // Stable: equal priorities keep their relative order.
        entries.sort_by_key(|e| e.priority);
        self.entries = entries.into();
    }

    /// Withdraws a pending (sub-)request, splitting its aggregate if needed.
    pub fn cancel(
        &mut self,
        file_id: &str,
        direction: Direction,
        offset: u64,
        length: u64,
    ) -> Option<Request> {
        let (idx, pos) = self.entries.iter().enumerate().find_map(|(i, e)| {
            if &**e.node.file_id() != file_id {
                return None;
            }
            e.node.position_of(direction, offset, length).map(|p| (i, p))
        })?;
        let entry = self.entries.remove(idx)?;
        let (removed, runs) = aggregation::remove_sub(entry.node, pos);
        for (k, run) in runs.into_iter().enumerate() {
            let priority = self.priority(&run);
            self.entries.insert(idx + k, TimelineEntry { node: run, priority });
        }
        self.requests -= 1;
        Some(removed)
    }

    pub fn drain(&mut self) -> Vec<RequestNode> {
        self.requests = 0;
        self.entries.drain(..).map(|e| e.node).collect()
    }

    /// `(file, direction, offset, length, count)` in queue order.
    pub fn snapshot(&self) -> Vec<(String, Direction, u64, u64, usize)> {
        self.entries
            .iter()
            .map(|e| {
                (
                    e.node.file_id().to_string(),
                    e.node.direction(),
                    e.node.offset(),
                    e.node.length(),
                    e.node.count(),
                )
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimelineEntry> {
        self.entries.iter()
    }
}

pub struct Timeline {
    inner: Mutex<TimelineQueue>,
}

impl Timeline {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TimelineQueue::new()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, TimelineQueue> {
        self.inner.lock()
    }

    pub fn snapshot(&self) -> Vec<(String, Direction, u64, u64, usize)> {
        self.inner.lock().snapshot()
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new()
    }
}
