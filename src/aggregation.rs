//! Aggregation engine.
//!
//! Pending requests of one file and one direction are kept in an
//! offset-sorted queue. A newly arriving entry is merged with its immediate
//! neighbours when their intervals touch or overlap, producing aggregates
//! that are dispatched as a single virtual request.

use crate::request::{AggregateHead, Request, RequestNode, SubRequests};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Inserted as its own queue entry.
    Standalone,
    /// Merged into an existing entry that now holds `count` requests.
    Aggregated { count: usize },
}

impl InsertOutcome {
    pub fn aggregated(&self) -> bool {
        matches!(self, InsertOutcome::Aggregated { .. })
    }
}

/// Merges `other` into `target`, promoting a singleton to an aggregate shell.
pub fn absorb(target: &mut RequestNode, other: RequestNode) {
    let factor = target.sched_factor().max(other.sched_factor());
    match target {
        RequestNode::Aggregate(head, subs) => {
            for request in other.into_subs() {
                insert_sorted(subs, request);
            }
            *head = AggregateHead::from_subs(subs, factor);
        }
        RequestNode::Singleton(request) => {
            let mut subs = SubRequests::new();
            subs.push(request.clone());
            for request in other.into_subs() {
                insert_sorted(&mut subs, request);
            }
            let head = AggregateHead::from_subs(&subs, factor);
            *target = RequestNode::Aggregate(head, subs);
        }
    }
}

fn insert_sorted(subs: &mut SubRequests, request: Request) {
    let pos = subs.partition_point(|s| s.offset <= request.offset);
    subs.insert(pos, request);
}

/// Inserts `node` into the offset-sorted `queue`, aggregating with the
/// predecessor and/or successor when contiguous and within `max_aggregation`
/// sub-requests.
pub fn try_insert(
    queue: &mut Vec<RequestNode>,
    node: RequestNode,
    max_aggregation: usize,
) -> InsertOutcome {
    let start = node.offset();
    let end = node.end();
    let n = node.count();
    let idx = queue.partition_point(|e| e.offset() <= start);

    let pred = idx.checked_sub(1).filter(|&p| queue[p].touches(start, end));
    let succ = Some(idx).filter(|&s| s < queue.len() && queue[s].touches(start, end));

    if let (Some(p), Some(s)) = (pred, succ) {
        if queue[p].count() + queue[s].count() + n <= max_aggregation {
            let successor = queue.remove(s);
            absorb(&mut queue[p], successor);
            absorb(&mut queue[p], node);
            return InsertOutcome::Aggregated {
                count: queue[p].count(),
            };
        }
    }

    let pred_fits = pred.filter(|&p| queue[p].count() + n <= max_aggregation);
    let succ_fits = succ.filter(|&s| queue[s].count() + n <= max_aggregation);

    let target = match (pred_fits, succ_fits) {
        // Both sides fit on their own: prefer the side already larger.
        (Some(p), Some(s)) => {
            if queue[s].count() > queue[p].count() {
                s
            } else {
                p
            }
        }
        (Some(p), None) => p,
        (None, Some(s)) => s,
        (None, None) => {
            queue.insert(idx, node);
            return InsertOutcome::Standalone;
        }
    };

    absorb(&mut queue[target], node);
    InsertOutcome::Aggregated {
        count: queue[target].count(),
    }
}

/// Removes sub-request `pos` from `node`.
///
/// The remaining sub-requests are regrouped into maximal contiguous runs:
/// a run of one becomes a singleton again, longer runs stay aggregates. The
/// runs come back in offset order.
pub fn remove_sub(node: RequestNode, pos: usize) -> (Request, Vec<RequestNode>) {
    let factor = node.sched_factor();
    let mut subs = node.into_subs();
    let mut removed = subs.remove(pos);
    removed.sched_factor = removed.sched_factor.max(factor);

    let mut runs: Vec<RequestNode> = Vec::new();
    let mut current = SubRequests::new();
    let mut current_end = 0u64;

    for request in subs {
        if !current.is_empty() && request.offset > current_end {
            runs.push(close_run(std::mem::take(&mut current), factor));
        }
        current_end = if current.is_empty() {
            request.end()
        } else {
            current_end.max(request.end())
        };
        current.push(request);
    }
    if !current.is_empty() {
        runs.push(close_run(current, factor));
    }

    (removed, runs)
}

fn close_run(mut run: SubRequests, factor: u64) -> RequestNode {
    if run.len() == 1 {
        let mut request = run.remove(0);
        request.sched_factor = factor;
        RequestNode::Singleton(request)
    } else {
        let head = AggregateHead::from_subs(&run, factor);
        RequestNode::Aggregate(head, run)
    }
}

/// `offset == min(sub.offset)` and `end == max(sub.end)`.
pub fn interval_invariant_holds(node: &RequestNode) -> bool {
    let subs = node.subs();
    let min = subs.iter().map(|r| r.offset).min();
    let max = subs.iter().map(|r| r.end()).max();
    min == Some(node.offset()) && max == Some(node.end())
}

/// Entries are non-decreasing by offset.
pub fn is_offset_sorted(queue: &[RequestNode]) -> bool {
    queue.windows(2).all(|w| w[0].offset() <= w[1].offset())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{test_request, Direction};

    fn node(offset: u64, length: u64) -> RequestNode {
        test_request("f", Direction::Read, offset, length).into()
    }

    fn shape(queue: &[RequestNode]) -> Vec<(u64, u64, usize)> {
        queue
            .iter()
            .map(|n| (n.offset(), n.length(), n.count()))
            .collect()
    }

    #[test]
    fn test_contiguous_with_predecessor() {
        let mut queue = Vec::new();
        assert_eq!(try_insert(&mut queue, node(0, 100), 16), InsertOutcome::Standalone);
        assert_eq!(
            try_insert(&mut queue, node(100, 100), 16),
            InsertOutcome::Aggregated { count: 2 }
        );
        assert_eq!(shape(&queue), vec![(0, 200, 2)]);
        assert!(interval_invariant_holds(&queue[0]));
    }

    #[test]
    fn test_contiguous_with_successor_prepends() {
        let mut queue = Vec::new();
        try_insert(&mut queue, node(100, 100), 16);
        try_insert(&mut queue, node(0, 100), 16);
        assert_eq!(shape(&queue), vec![(0, 200, 2)]);
        assert_eq!(queue[0].subs()[0].offset, 0);
        assert_eq!(queue[0].subs()[1].offset, 100);
    }

    #[test]
    fn test_gap_keeps_singletons() {
        let mut queue = Vec::new();
        try_insert(&mut queue, node(300, 100), 16);
        try_insert(&mut queue, node(0, 100), 16);
        assert_eq!(shape(&queue), vec![(0, 100, 1), (300, 100, 1)]);
        assert!(is_offset_sorted(&queue));
    }

    #[test]
    fn test_bridge_merges_both_sides() {
        let mut queue = Vec::new();
        try_insert(&mut queue, node(0, 100), 16);
        try_insert(&mut queue, node(200, 100), 16);
        let outcome = try_insert(&mut queue, node(100, 100), 16);
        assert_eq!(outcome, InsertOutcome::Aggregated { count: 3 });
        assert_eq!(shape(&queue), vec![(0, 300, 3)]);
    }

    #[test]
    fn test_overlap_counts_as_contiguous() {
        let mut queue = Vec::new();
        try_insert(&mut queue, node(0, 100), 16);
        try_insert(&mut queue, node(50, 100), 16);
        assert_eq!(shape(&queue), vec![(0, 150, 2)]);
    }

    #[test]
    fn test_limit_prefers_larger_side() {
        let mut queue = Vec::new();
        // predecessor aggregate of 2, successor singleton
        try_insert(&mut queue, node(0, 100), 3);
        try_insert(&mut queue, node(100, 100), 3);
        try_insert(&mut queue, node(300, 100), 3);
        assert_eq!(shape(&queue), vec![(0, 200, 2), (300, 100, 1)]);

        // bridging would give 4 > 3; each side alone fits, predecessor is larger
        let outcome = try_insert(&mut queue, node(200, 100), 3);
        assert_eq!(outcome, InsertOutcome::Aggregated { count: 3 });
        assert_eq!(shape(&queue), vec![(0, 300, 3), (300, 100, 1)]);
    }

    #[test]
    fn test_limit_falls_back_to_side_that_fits() {
        let mut queue = Vec::new();
        try_insert(&mut queue, node(0, 100), 2);
        try_insert(&mut queue, node(100, 100), 2);
        try_insert(&mut queue, node(300, 100), 2);
        let outcome = try_insert(&mut queue, node(200, 100), 2);
        assert_eq!(outcome, InsertOutcome::Aggregated { count: 2 });
        assert_eq!(shape(&queue), vec![(0, 200, 2), (200, 200, 2)]);
    }

    #[test]
    fn test_no_aggregation_when_limit_is_one() {
        let mut queue = Vec::new();
        try_insert(&mut queue, node(0, 100), 1);
        try_insert(&mut queue, node(100, 100), 1);
        assert_eq!(shape(&queue), vec![(0, 100, 1), (100, 100, 1)]);
    }

    #[test]
    fn test_remove_middle_splits_into_singletons() {
        let mut queue = Vec::new();
        try_insert(&mut queue, node(0, 100), 16);
        try_insert(&mut queue, node(200, 100), 16);
        try_insert(&mut queue, node(100, 100), 16);

        let aggregate = queue.remove(0);
        let pos = aggregate.position_of(Direction::Read, 100, 100).unwrap();
        let (removed, runs) = remove_sub(aggregate, pos);
        assert_eq!((removed.offset, removed.length), (100, 100));
        assert_eq!(shape(&runs), vec![(0, 100, 1), (200, 100, 1)]);
        assert!(runs.iter().all(|r| !r.is_aggregate()));
    }

    #[test]
    fn test_remove_edge_keeps_aggregate() {
        let mut queue = Vec::new();
        for off in [0, 100, 200] {
            try_insert(&mut queue, node(off, 100), 16);
        }
        let aggregate = queue.remove(0);
        let (_, runs) = remove_sub(aggregate, 0);
        assert_eq!(shape(&runs), vec![(100, 200, 2)]);
        assert!(interval_invariant_holds(&runs[0]));
    }

    #[test]
    fn test_sched_factor_survives_merge_and_split() {
        let mut a = node(0, 100);
        a.set_sched_factor(8);
        let b = node(100, 100);
        absorb(&mut a, b);
        assert_eq!(a.sched_factor(), 8);
        let (_, runs) = remove_sub(a, 1);
        assert_eq!(runs[0].sched_factor(), 8);
    }
}
