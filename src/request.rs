//! Request data model.
//!
//! A [`Request`] is one I/O operation as submitted by the caller. Pending
//! requests live inside the indexes as [`RequestNode`]s: either a lone
//! request or an aggregate ("virtual request") that covers several contiguous
//! requests of the same file and direction.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::sync::Arc;

/// Caller-opaque completion token handed back on dispatch.
pub type Token = u64;

/// Sub-request list of an aggregate, kept offset-sorted.
pub type SubRequests = SmallVec<[Request; 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Read, Direction::Write];

    pub fn index(self) -> usize {
        match self {
            Direction::Read => 0,
            Direction::Write => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Read => "R",
            Direction::Write => "W",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub file_id: Arc<str>,
    pub direction: Direction,
    pub offset: u64,
    pub length: u64,
    /// Arrival time in nanoseconds since scheduler start.
    pub arrival: u64,
    /// Global arrival sequence number.
    pub seq: u64,
    pub token: Token,
    pub stream_id: u32,
    /// Eligibility counter for MLF / aIOLi while the request stands alone.
    pub sched_factor: u64,
}

impl Request {
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    /// Exact (direction, offset, length) match used by release and cancel.
    pub fn matches(&self, direction: Direction, offset: u64, length: u64) -> bool {
        self.direction == direction && self.offset == offset && self.length == length
    }
}

/// Bookkeeping of an aggregate shell.
#[derive(Debug, Clone)]
pub struct AggregateHead {
    pub offset: u64,
    pub length: u64,
    pub earliest_arrival: u64,
    pub first_seq: u64,
    pub sched_factor: u64,
}

impl AggregateHead {
    /// Recomputes the bounding interval and earliest arrival from `subs`.
    pub fn from_subs(subs: &[Request], sched_factor: u64) -> Self {
        debug_assert!(!subs.is_empty());
        let offset = subs.iter().map(|r| r.offset).min().unwrap_or(0);
        let end = subs.iter().map(|r| r.end()).max().unwrap_or(offset);
        Self {
            offset,
            length: end - offset,
            earliest_arrival: subs.iter().map(|r| r.arrival).min().unwrap_or(0),
            first_seq: subs.iter().map(|r| r.seq).min().unwrap_or(0),
            sched_factor,
        }
    }
}

/// One structural queue entry.
#[derive(Debug, Clone)]
pub enum RequestNode {
    Singleton(Request),
    Aggregate(AggregateHead, SubRequests),
}

impl RequestNode {
    pub fn offset(&self) -> u64 {
        match self {
            RequestNode::Singleton(r) => r.offset,
            RequestNode::Aggregate(h, _) => h.offset,
        }
    }

    pub fn length(&self) -> u64 {
        match self {
            RequestNode::Singleton(r) => r.length,
            RequestNode::Aggregate(h, _) => h.length,
        }
    }

    pub fn end(&self) -> u64 {
        self.offset().saturating_add(self.length())
    }

    /// Number of original requests represented by this entry.
    pub fn count(&self) -> usize {
        match self {
            RequestNode::Singleton(_) => 1,
            RequestNode::Aggregate(_, subs) => subs.len(),
        }
    }

    pub fn earliest_arrival(&self) -> u64 {
        match self {
            RequestNode::Singleton(r) => r.arrival,
            RequestNode::Aggregate(h, _) => h.earliest_arrival,
        }
    }

    pub fn first_seq(&self) -> u64 {
        match self {
            RequestNode::Singleton(r) => r.seq,
            RequestNode::Aggregate(h, _) => h.first_seq,
        }
    }

    pub fn sched_factor(&self) -> u64 {
        match self {
            RequestNode::Singleton(r) => r.sched_factor,
            RequestNode::Aggregate(h, _) => h.sched_factor,
        }
    }

    pub fn set_sched_factor(&mut self, factor: u64) {
        match self {
            RequestNode::Singleton(r) => r.sched_factor = factor,
            RequestNode::Aggregate(h, _) => h.sched_factor = factor,
        }
    }

    /// Doubles the eligibility counter (0 becomes 1) and returns the new value.
    pub fn bump_sched_factor(&mut self) -> u64 {
        let next = match self.sched_factor() {
            0 => 1,
            f => f.saturating_mul(2).min(MAX_SCHED_FACTOR),
        };
        self.set_sched_factor(next);
        next
    }

    /// `sched_factor × quantum ≥ length`.
    pub fn is_eligible(&self, quantum: u64) -> bool {
        self.sched_factor().saturating_mul(quantum) >= self.length()
    }

    pub fn first(&self) -> &Request {
        match self {
            RequestNode::Singleton(r) => r,
            RequestNode::Aggregate(_, subs) => &subs[0],
        }
    }

    pub fn file_id(&self) -> &Arc<str> {
        &self.first().file_id
    }

    pub fn direction(&self) -> Direction {
        self.first().direction
    }

    pub fn stream_id(&self) -> u32 {
        self.first().stream_id
    }

    pub fn subs(&self) -> &[Request] {
        match self {
            RequestNode::Singleton(r) => std::slice::from_ref(r),
            RequestNode::Aggregate(_, subs) => subs,
        }
    }

    pub fn into_subs(self) -> SubRequests {
        match self {
            RequestNode::Singleton(r) => {
                let mut subs = SubRequests::new();
                subs.push(r);
                subs
            }
            RequestNode::Aggregate(_, subs) => subs,
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, RequestNode::Aggregate(..))
    }

    /// Intervals `[offset, end)` touch or overlap.
    pub fn touches(&self, offset: u64, end: u64) -> bool {
        self.offset() <= end && offset <= self.end()
    }

    pub fn position_of(&self, direction: Direction, offset: u64, length: u64) -> Option<usize> {
        self.subs()
            .iter()
            .position(|r| r.matches(direction, offset, length))
    }
}

impl From<Request> for RequestNode {
    fn from(request: Request) -> Self {
        RequestNode::Singleton(request)
    }
}

pub const MAX_SCHED_FACTOR: u64 = 1 << 40;

/// A request handed out to the caller and awaiting `complete`.
#[derive(Debug, Clone)]
pub struct DispatchRecord {
    pub request: Request,
    pub dispatched_at: u64,
    /// Dispatched while an aIOLi quantum was open on its queue.
    pub in_quantum: bool,
    /// Dispatched under a synchronous policy; release wakes the scheduler.
    pub synchronous: bool,
}

#[cfg(test)]
pub(crate) fn test_request(file: &str, direction: Direction, offset: u64, length: u64) -> Request {
    use std::sync::atomic::{AtomicU64, Ordering};
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    Request {
        file_id: Arc::from(file),
        direction,
        offset,
        length,
        arrival: seq,
        seq,
        token: seq,
        stream_id: 0,
        sched_factor: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touches_is_overlap_or_adjacency() {
        let node = RequestNode::from(test_request("f", Direction::Read, 100, 100));
        assert!(node.touches(0, 100));
        assert!(node.touches(200, 300));
        assert!(node.touches(150, 160));
        assert!(!node.touches(0, 99));
        assert!(!node.touches(201, 300));
    }

    #[test]
    fn test_sched_factor_doubles() {
        let mut node = RequestNode::from(test_request("f", Direction::Read, 0, 8192 * 4));
        assert_eq!(node.bump_sched_factor(), 1);
        assert!(!node.is_eligible(8192));
        assert_eq!(node.bump_sched_factor(), 2);
        assert_eq!(node.bump_sched_factor(), 4);
        assert!(node.is_eligible(8192));
    }

    #[test]
    fn test_aggregate_head_from_subs() {
        let subs = [
            test_request("f", Direction::Write, 50, 100),
            test_request("f", Direction::Write, 0, 60),
        ];
        let head = AggregateHead::from_subs(&subs, 3);
        assert_eq!(head.offset, 0);
        assert_eq!(head.length, 150);
        assert_eq!(head.sched_factor, 3);
        assert_eq!(head.earliest_arrival, subs[0].arrival.min(subs[1].arrival));
    }
}
