use lightning_iosched::aggregation::{interval_invariant_holds, is_offset_sorted};
use lightning_iosched::policy::{SchedulingPolicy, TimeOrderPolicy};
use lightning_iosched::scheduler::SchedulerCore;
use lightning_iosched::{Direction, PolicyKind, SchedulerConfig};
use proptest::collection::vec as prop_vec;
use proptest::prelude::*;
use std::collections::{BTreeSet, HashSet};

mod common;
use common::{config_for, recording_core};

const SLOT: u64 = 64;

/// `(file, direction, slot, length)`; offsets are `slot * SLOT`, so lengths
/// above `SLOT` overlap the next slot and shorter ones leave a gap.
fn request_strategy() -> impl Strategy<Value = (u8, bool, u16, u64)> {
    (0u8..3, any::<bool>(), 0u16..48, prop_oneof![Just(32u64), Just(64), Just(96)])
}

fn direction(read: bool) -> Direction {
    if read {
        Direction::Read
    } else {
        Direction::Write
    }
}

/// Submits the distinct requests and returns them with their tokens.
fn submit_unique(
    core: &SchedulerCore,
    requests: &[(u8, bool, u16, u64)],
) -> Vec<(String, Direction, u64, u64, u64)> {
    let mut seen = HashSet::new();
    let mut submitted = Vec::new();
    for &(file, read, slot, length) in requests {
        if !seen.insert((file, read, slot)) {
            continue;
        }
        let file_id = format!("file_{}", file);
        let token = submitted.len() as u64;
        let offset = slot as u64 * SLOT;
        core.submit(&file_id, direction(read), offset, length, token, 0)
            .unwrap();
        submitted.push((file_id, direction(read), offset, length, token));
    }
    submitted
}

fn check_index_invariants(core: &SchedulerCore, expected_requests: usize) {
    let max_aggregation = core.config().max_aggregation_size;
    let mut total = 0;
    for b in 0..core.index().bucket_count() {
        let bucket = core.index().lock(b);
        for fq in &bucket.files {
            for d in Direction::ALL {
                let queue = &fq.queue(d).entries;
                assert!(is_offset_sorted(queue));
                for node in queue {
                    assert!(interval_invariant_holds(node));
                    assert!(node.count() <= max_aggregation);
                    assert!(node.subs().iter().all(|r| r.direction == d));
                    assert!(node.subs().iter().all(|r| r.file_id == fq.file_id));
                    total += node.count();
                }
            }
        }
    }
    assert_eq!(total, expected_requests);
    assert_eq!(core.counters().requests(), expected_requests);
}

/// Serves everything still pending in arrival order.
fn drain_in_order(core: &SchedulerCore) {
    core.migrate(PolicyKind::TimeOrder);
    let mut policy = TimeOrderPolicy::new(PolicyKind::TimeOrder);
    while core.counters().requests() > 0 {
        policy.schedule(core);
    }
}

// Property: aggregation keeps queues sorted and aggregates consistent
proptest! {
    #[test]
    fn prop_admission_invariants(
        requests in prop_vec(request_strategy(), 1..120),
        max_aggregation in 1usize..=16
    ) {
        let config = SchedulerConfig {
            max_aggregation_size: max_aggregation,
            ..config_for(PolicyKind::Mlf)
        };
        let (core, _) = recording_core(config);
        let submitted = submit_unique(&core, &requests);
        check_index_invariants(&core, submitted.len());
    }
}

// Property: cancelling never loses or duplicates another request
proptest! {
    #[test]
    fn prop_cancel_conserves_requests(
        requests in prop_vec(request_strategy(), 1..80),
        cancel_mask in prop_vec(any::<bool>(), 80),
        max_aggregation in 1usize..=16
    ) {
        let config = SchedulerConfig {
            max_aggregation_size: max_aggregation,
            ..config_for(PolicyKind::Mlf)
        };
        let (core, seen) = recording_core(config);
        let submitted = submit_unique(&core, &requests);

        let mut kept = BTreeSet::new();
        for (i, (file, d, offset, length, token)) in submitted.iter().enumerate() {
            if cancel_mask[i] {
                core.cancel(file, *d, *offset, *length).unwrap();
                prop_assert!(core.cancel(file, *d, *offset, *length).is_err());
            } else {
                kept.insert(*token);
            }
        }
        check_index_invariants(&core, kept.len());

        drain_in_order(&core);
        let served: BTreeSet<u64> = seen.lock().iter().map(|r| r.token).collect();
        prop_assert_eq!(seen.lock().len(), kept.len());
        prop_assert_eq!(served, kept);
    }
}

// Property: migrating between index kinds preserves every pending request
proptest! {
    #[test]
    fn prop_migration_preserves_requests(
        requests in prop_vec(request_strategy(), 1..80),
        targets in prop_vec(
            prop_oneof![
                Just(PolicyKind::Aioli),
                Just(PolicyKind::Sjf),
                Just(PolicyKind::TimeOrder),
                Just(PolicyKind::TimeOrderAggregation),
                Just(PolicyKind::TimeWindow),
                Just(PolicyKind::Mlf),
            ],
            1..6
        )
    ) {
        let (core, seen) = recording_core(config_for(PolicyKind::Mlf));
        let submitted = submit_unique(&core, &requests);

        for target in targets {
            core.migrate(target);
            prop_assert_eq!(core.counters().requests(), submitted.len());
            if target.descriptor().needs_hashtable {
                check_index_invariants(&core, submitted.len());
            } else {
                let queued: usize = core.timeline().snapshot().iter().map(|e| e.4).sum();
                prop_assert_eq!(queued, submitted.len());
                prop_assert_eq!(core.index().pending_entries(), 0);
            }
        }

        drain_in_order(&core);
        let served: BTreeSet<u64> = seen.lock().iter().map(|r| r.token).collect();
        prop_assert_eq!(served.len(), submitted.len());
        prop_assert_eq!(seen.lock().len(), submitted.len());
        prop_assert_eq!(core.counters().files(), 0);
    }
}
