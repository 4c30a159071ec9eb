//! Per-file request state shared by both indexes.

use crate::aggregation::{self, InsertOutcome};
use crate::request::{Direction, DispatchRecord, Request, RequestNode, SubRequests};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Global pending counters.
///
/// Updated under whichever lock guards the structural change that moves
/// them; read without any lock elsewhere.
#[derive(Debug, Default)]
pub struct PendingCounters {
    requests: AtomicUsize,
    files: AtomicUsize,
}

impl PendingCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Real (non-structural) pending request count.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::Acquire)
    }

    /// Distinct files with at least one pending request.
    pub fn files(&self) -> usize {
        self.files.load(Ordering::Acquire)
    }

    pub(crate) fn add_requests(&self, n: usize) {
        self.requests.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn sub_requests(&self, n: usize) {
        let prev = self.requests.fetch_sub(n, Ordering::AcqRel);
        debug_assert!(prev >= n, "pending request counter underflow");
    }

    fn file_activated(&self) {
        self.files.fetch_add(1, Ordering::AcqRel);
    }

    fn file_idled(&self) {
        let prev = self.files.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "pending file counter underflow");
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct AggregationStats {
    /// Dispatched entries holding more than one request.
    pub aggregations: u64,
    pub dispatched_entries: u64,
    pub dispatched_requests: u64,
    /// Largest recent aggregation; decays by one on every smaller dispatch.
    pub best: usize,
    pub last: usize,
}

impl AggregationStats {
    pub fn record(&mut self, count: usize) {
        self.dispatched_entries += 1;
        self.dispatched_requests += count as u64;
        if count > 1 {
            self.aggregations += 1;
        }
        self.last = count;
        if count >= self.best {
            self.best = count;
        } else {
            self.best -= 1;
        }
    }

    pub fn average(&self) -> f64 {
        if self.dispatched_entries == 0 {
            0.0
        } else {
            self.dispatched_requests as f64 / self.dispatched_entries as f64
        }
    }

    fn reset_counts(&mut self) {
        self.aggregations = 0;
        self.dispatched_entries = 0;
        self.dispatched_requests = 0;
    }
}

/// Shift-phenomenon bookkeeping: where the last dispatch ended and where the
/// next request is expected to start.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShiftState {
    pub has_history: bool,
    pub last_end: u64,
    pub predicted_offset: u64,
}

/// aIOLi quantum bookkeeping of one queue, all values in nanoseconds.
#[derive(Debug, Default, Clone, Copy)]
pub struct QuantumState {
    /// Quantum to grant on the next selection (0 until first grant).
    pub next_quantum: u64,
    /// Quantum granted on the previous selection.
    pub granted: u64,
    /// Time from the grant to the latest release of a request dispatched
    /// under it.
    pub used: u64,
    pub granted_at: u64,
}

impl QuantumState {
    pub fn note_release(&mut self, now: u64) {
        self.used = self.used.max(now.saturating_sub(self.granted_at));
    }
}

#[derive(Debug, Default)]
pub struct DirectionQueue {
    /// Pending entries, offset-sorted.
    pub entries: Vec<RequestNode>,
    /// Handed out, awaiting release.
    pub dispatched: Vec<DispatchRecord>,
    pub bytes: u64,
    pub requests: usize,
    /// Bytes served since the queue last became non-empty.
    pub served_bytes: u64,
    /// Learned total size of the previous busy period.
    pub predicted_total: Option<u64>,
    pub shift: ShiftState,
    pub aggregation: AggregationStats,
    pub quantum: QuantumState,
}

impl DirectionQueue {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remaining predicted total size; twice the current size when nothing
    /// has been learned yet.
    pub fn predicted_remaining(&self) -> u64 {
        match self.predicted_total {
            Some(total) if total > self.served_bytes => total - self.served_bytes,
            _ => self.bytes.saturating_mul(2),
        }
    }

    fn add_node(&mut self, node: RequestNode, max_aggregation: usize) -> InsertOutcome {
        self.bytes += node.subs().iter().map(|r| r.length).sum::<u64>();
        self.requests += node.count();
        aggregation::try_insert(&mut self.entries, node, max_aggregation)
    }

    fn detach(&mut self, idx: usize) -> RequestNode {
        let node = self.entries.remove(idx);
        self.bytes -= node.subs().iter().map(|r| r.length).sum::<u64>();
        self.requests -= node.count();
        node
    }
}

pub struct FileQueues {
    pub file_id: Arc<str>,
    pub queues: [DirectionQueue; 2],
    /// Real requests of this file currently held by the timeline.
    pub timeline_pending: usize,
    /// Cooldown deadline armed by the waiting decision.
    pub waiting_until: Option<u64>,
    /// First sequence number of the entry the last cooldown was armed for.
    pub waited_seq: Option<u64>,
    pub first_arrival: Option<u64>,
}

impl FileQueues {
    pub fn new(file_id: Arc<str>) -> Self {
        Self {
            file_id,
            queues: [DirectionQueue::default(), DirectionQueue::default()],
            timeline_pending: 0,
            waiting_until: None,
            waited_seq: None,
            first_arrival: None,
        }
    }

    pub fn queue(&self, direction: Direction) -> &DirectionQueue {
        &self.queues[direction.index()]
    }

    pub fn queue_mut(&mut self, direction: Direction) -> &mut DirectionQueue {
        &mut self.queues[direction.index()]
    }

    pub fn pending_requests(&self) -> usize {
        self.queues[0].requests + self.queues[1].requests + self.timeline_pending
    }

    /// Remaining cooldown at `now`, clearing an expired one.
    pub fn cooldown_remaining(&mut self, now: u64) -> Option<u64> {
        match self.waiting_until {
            Some(until) if until > now => Some(until - now),
            Some(_) => {
                self.waiting_until = None;
                None
            }
            None => None,
        }
    }

    fn before_add(&mut self, now: u64, counters: &PendingCounters) {
        if self.pending_requests() == 0 {
            counters.file_activated();
            if self.first_arrival.is_none() {
                self.first_arrival = Some(now);
            }
        }
    }

    fn after_remove(&mut self, counters: &PendingCounters) {
        if self.pending_requests() == 0 {
            counters.file_idled();
        }
    }

    /// Adds a pending entry to its direction queue.
    pub fn insert(
        &mut self,
        node: RequestNode,
        max_aggregation: usize,
        now: u64,
        counters: &PendingCounters,
    ) -> InsertOutcome {
        let n = node.count();
        self.before_add(now, counters);
        let direction = node.direction();
        let outcome = self.queue_mut(direction).add_node(node, max_aggregation);
        counters.add_requests(n);
        outcome
    }

    /// Accounts for `count` requests of this file entering the timeline.
    pub fn note_timeline_add(&mut self, count: usize, now: u64, counters: &PendingCounters) {
        self.before_add(now, counters);
        self.timeline_pending += count;
        counters.add_requests(count);
    }

    /// Accounts for `count` requests of this file leaving the timeline.
    pub fn note_timeline_remove(&mut self, count: usize, counters: &PendingCounters) {
        debug_assert!(self.timeline_pending >= count);
        self.timeline_pending = self.timeline_pending.saturating_sub(count);
        counters.sub_requests(count);
        self.after_remove(counters);
    }

    /// Detaches pending entry `idx` of `direction`.
    pub fn take_entry(
        &mut self,
        direction: Direction,
        idx: usize,
        counters: &PendingCounters,
    ) -> RequestNode {
        let node = self.queue_mut(direction).detach(idx);
        counters.sub_requests(node.count());
        self.after_remove(counters);
        node
    }

    /// Moves every pending entry out, leaving counters to the caller's
    /// accounting (used by migration, where requests change index but stay
    /// pending).
    pub fn drain_pending(&mut self) -> Vec<RequestNode> {
        let mut drained = Vec::new();
        for queue in self.queues.iter_mut() {
            queue.bytes = 0;
            queue.requests = 0;
            drained.append(&mut queue.entries);
        }
        drained
    }

    /// Re-inserts a pending entry moved in by migration.
    pub fn adopt(&mut self, node: RequestNode, max_aggregation: usize) -> InsertOutcome {
        let direction = node.direction();
        self.queue_mut(direction).add_node(node, max_aggregation)
    }

    /// Records a dispatched entry: its sub-requests move to the dispatch
    /// queue and the shift / aggregation / prediction statistics advance.
    /// Returns the sub-requests to deliver.
    pub fn record_dispatch(
        &mut self,
        node: RequestNode,
        now: u64,
        in_quantum: bool,
        synchronous: bool,
    ) -> SubRequests {
        let direction = node.direction();
        let count = node.count();
        let end = node.end();
        let length = node.length();
        let queue = self.queue_mut(direction);

        queue.aggregation.record(count);
        queue.shift = ShiftState {
            has_history: true,
            last_end: end,
            predicted_offset: end.saturating_add(length / count.max(1) as u64),
        };
        queue.served_bytes += length;
        if queue.entries.is_empty() {
            queue.predicted_total = Some(queue.served_bytes);
            queue.served_bytes = 0;
        }

        let subs = node.into_subs();
        for request in subs.iter() {
            queue.dispatched.push(DispatchRecord {
                request: request.clone(),
                dispatched_at: now,
                in_quantum,
                synchronous,
            });
        }
        subs
    }

    /// Withdraws a pending (sub-)request, splitting its aggregate if needed.
    pub fn cancel_pending(
        &mut self,
        direction: Direction,
        offset: u64,
        length: u64,
        counters: &PendingCounters,
    ) -> Option<Request> {
        let queue = self.queue_mut(direction);
        let (idx, pos) = queue.entries.iter().enumerate().find_map(|(i, node)| {
            node.position_of(direction, offset, length).map(|p| (i, p))
        })?;

        let node = queue.entries.remove(idx);
        let (removed, runs) = aggregation::remove_sub(node, pos);
        // A standalone entry may sit inside the old interval, so each run
        // goes back at its own offset.
        for run in runs {
            let at = queue.entries.partition_point(|e| e.offset() <= run.offset());
            queue.entries.insert(at, run);
        }
        queue.bytes -= removed.length;
        queue.requests -= 1;

        counters.sub_requests(1);
        self.after_remove(counters);
        Some(removed)
    }

    /// Removes a dispatched request matched exactly.
    pub fn take_dispatched(
        &mut self,
        direction: Direction,
        offset: u64,
        length: u64,
    ) -> Option<DispatchRecord> {
        let queue = self.queue_mut(direction);
        let idx = queue
            .dispatched
            .iter()
            .position(|d| d.request.matches(direction, offset, length))?;
        Some(queue.dispatched.remove(idx))
    }

    pub fn reset_stats(&mut self) {
        for queue in self.queues.iter_mut() {
            queue.aggregation.reset_counts();
        }
    }

    pub fn snapshot(&self) -> FileSnapshot {
        FileSnapshot {
            file_id: self.file_id.to_string(),
            pending_reads: self.queues[0].requests,
            pending_writes: self.queues[1].requests,
            timeline_pending: self.timeline_pending,
            dispatched: self.queues[0].dispatched.len() + self.queues[1].dispatched.len(),
            read_aggregation: self.queues[0].aggregation.clone(),
            write_aggregation: self.queues[1].aggregation.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileSnapshot {
    pub file_id: String,
    pub pending_reads: usize,
    pub pending_writes: usize,
    pub timeline_pending: usize,
    pub dispatched: usize,
    pub read_aggregation: AggregationStats,
    pub write_aggregation: AggregationStats,
}
