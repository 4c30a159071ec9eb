//! Scheduler core.
//!
//! [`SchedulerCore`] owns every piece of shared state: both indexes, the
//! pending counters, the active policy and the wake-up channels. Caller
//! threads enter through `submit`, `complete` and `cancel`; the single
//! scheduling thread runs [`run_dispatch_loop`].
//!
//! Lock order is fixed: the timeline first, then buckets by ascending index.
//! Admission, release and cancel take at most the timeline plus one bucket,
//! in that order. Migration takes all of them.

use crate::access_time::{AccessTimeModel, LinearAccessModel};
use crate::bandwidth::BandwidthTracker;
use crate::clock::{ms_to_ns, Clock};
use crate::config::SchedulerConfig;
use crate::dynamic::{self, MetaPolicy};
use crate::error::{Error, Result};
use crate::file_queues::{FileQueues, PendingCounters};
use crate::hashtable::{Bucket, BucketedIndex};
use crate::policy::waiting::AggregationPredictor;
use crate::policy::{
    self, ActivePolicy, PolicyKind, PolicySnapshot, ScheduleOutcome, SchedulingPolicy,
};
use crate::request::{Direction, Request, RequestNode, SubRequests, Token};
use crate::stats::{SchedulerStats, StatsReport};
use crate::timeline::Timeline;
use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Callback receiving one dispatched request.
pub type ProcessOne = Box<dyn Fn(&Request) + Send + Sync>;
/// Callback receiving every sub-request of a dispatched aggregate at once.
pub type ProcessMany = Box<dyn Fn(&[Request]) + Send + Sync>;

const SYNC_POLL: Duration = Duration::from_millis(10);
const RETRY_PAUSE: Duration = Duration::from_micros(100);

pub struct Callbacks {
    one: Option<ProcessOne>,
    many: Option<ProcessMany>,
}

impl Callbacks {
    pub fn new(one: Option<ProcessOne>, many: Option<ProcessMany>) -> Result<Self> {
        if one.is_none() && many.is_none() {
            return Err(Error::NoCallback);
        }
        Ok(Self { one, many })
    }

    fn deliver(&self, subs: &[Request]) {
        match (&self.one, &self.many) {
            (_, Some(many)) if subs.len() > 1 => many(subs),
            (Some(one), _) => subs.iter().for_each(|r| one(r)),
            (None, Some(many)) => many(subs),
            (None, None) => {}
        }
    }
}

pub struct SchedulerCore {
    config: SchedulerConfig,
    clock: Clock,
    index: BucketedIndex,
    timeline: Timeline,
    counters: PendingCounters,
    active: ActivePolicy,
    callbacks: Callbacks,
    stats: SchedulerStats,
    access_model: Arc<dyn AccessTimeModel>,
    predictor: Option<Arc<dyn AggregationPredictor>>,
    max_stream_id: u32,
    next_seq: AtomicU64,
    stop: AtomicBool,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    ack_tx: Sender<()>,
    ack_rx: Receiver<()>,
    /// Synchronously dispatched requests not yet released.
    outstanding_sync: AtomicUsize,
    forced_policy: Mutex<Option<PolicyKind>>,
    processed_since_selection: AtomicU64,
    bytes_since_selection: AtomicU64,
}

impl SchedulerCore {
    pub fn new(config: SchedulerConfig, callbacks: Callbacks, max_stream_id: u32) -> Self {
        let start = config.starting_policy_kind();
        let initial = if start.descriptor().is_dynamic {
            config.default_policy_kind()
        } else {
            start
        };
        let (wake_tx, wake_rx) = bounded(1);
        let (ack_tx, ack_rx) = bounded(1);
        let access_model: Arc<dyn AccessTimeModel> =
            Arc::new(LinearAccessModel::from_config(&config));

        let timeline = Timeline::new();
        let desc = initial.descriptor();
        timeline.lock().configure(
            desc.timeline_order(&config, max_stream_id.max(1)),
            desc.effective_max_aggregation(&config),
        );

        Self {
            index: BucketedIndex::new(config.hash_buckets),
            timeline,
            clock: Clock::new(),
            counters: PendingCounters::new(),
            active: ActivePolicy::new(initial),
            callbacks,
            stats: SchedulerStats::new(),
            access_model,
            predictor: None,
            max_stream_id: max_stream_id.max(1),
            next_seq: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            wake_tx,
            wake_rx,
            ack_tx,
            ack_rx,
            outstanding_sync: AtomicUsize::new(0),
            forced_policy: Mutex::new(None),
            processed_since_selection: AtomicU64::new(0),
            bytes_since_selection: AtomicU64::new(0),
            config,
        }
    }

    pub fn with_access_model(mut self, model: Arc<dyn AccessTimeModel>) -> Self {
        self.access_model = model;
        self
    }

    pub fn with_predictor(mut self, predictor: Arc<dyn AggregationPredictor>) -> Self {
        self.predictor = Some(predictor);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn now(&self) -> u64 {
        self.clock.now_ns()
    }

    pub fn index(&self) -> &BucketedIndex {
        &self.index
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn counters(&self) -> &PendingCounters {
        &self.counters
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn access_model(&self) -> &dyn AccessTimeModel {
        self.access_model.as_ref()
    }

    pub fn predictor(&self) -> Option<&dyn AggregationPredictor> {
        self.predictor.as_deref()
    }

    pub fn active_policy(&self) -> PolicyKind {
        self.active.kind()
    }

    pub fn max_stream_id(&self) -> u32 {
        self.max_stream_id
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.wake_tx.try_send(());
        let _ = self.ack_tx.try_send(());
    }

    fn notify_work(&self) {
        let _ = self.wake_tx.try_send(());
    }

    /// Blocks until new work is signalled or `timeout` passes.
    pub fn wait_for_work(&self, timeout: Duration) {
        let _ = self.wake_rx.recv_timeout(timeout);
    }

    /// A policy should hand control back to the core.
    pub fn should_yield(&self, deadline: u64) -> bool {
        self.is_stopping() || self.counters.requests() == 0 || self.now() >= deadline
    }

    pub fn refresh_deadline(&self) -> u64 {
        self.now()
            .saturating_add(ms_to_ns(self.config.refresh_interval_ms.max(1)))
    }

    pub fn force_policy(&self, kind: PolicyKind) {
        *self.forced_policy.lock() = Some(kind);
        self.notify_work();
    }

    fn take_forced_policy(&self) -> Option<PolicyKind> {
        self.forced_policy.lock().take()
    }

    /// Admits one request.
    pub fn submit(
        &self,
        file_id: &str,
        direction: Direction,
        offset: u64,
        length: u64,
        token: Token,
        stream_id: u32,
    ) -> Result<()> {
        if self.is_stopping() {
            return Err(Error::ShuttingDown);
        }
        let stream_id = if stream_id >= self.max_stream_id {
            warn!(
                "Stream id {} out of range, clamping to {}",
                stream_id,
                self.max_stream_id - 1
            );
            self.max_stream_id - 1
        } else {
            stream_id
        };

        let now = self.now();
        let request = Request {
            file_id: Arc::from(file_id),
            direction,
            offset,
            length,
            arrival: now,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            token,
            stream_id,
            sched_factor: 0,
        };

        loop {
            let snap = self.active.snapshot();
            let desc = snap.kind.descriptor();

            if snap.kind == PolicyKind::Noop {
                self.stats.record_received(false);
                self.stats.record_dispatch(PolicyKind::Noop, 1);
                self.callbacks.deliver(std::slice::from_ref(&request));
                self.note_release(length);
                return Ok(());
            }

            let max_aggregation = desc.effective_max_aggregation(&self.config);
            let outcome = if desc.needs_hashtable {
                let mut bucket = self.index.lock(self.index.bucket_of(file_id));
                if self.active.epoch() != snap.epoch {
                    drop(bucket);
                    self.stats.lock_retries.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                bucket.add(request.into(), max_aggregation, now, &self.counters)
            } else {
                let mut timeline = self.timeline.lock();
                if self.active.epoch() != snap.epoch {
                    drop(timeline);
                    self.stats.lock_retries.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                {
                    let mut bucket = self.index.lock(self.index.bucket_of(file_id));
                    bucket
                        .find_or_create(&request.file_id)
                        .note_timeline_add(1, now, &self.counters);
                }
                timeline.add(request.into())
            };

            self.stats.record_received(outcome.aggregated());
            debug!(
                "Admitted {} {} offset={} length={} ({:?})",
                file_id,
                direction.as_str(),
                offset,
                length,
                outcome
            );
            break;
        }

        self.notify_work();
        Ok(())
    }

    /// Acknowledges a dispatched request.
    pub fn complete(
        &self,
        file_id: &str,
        direction: Direction,
        offset: u64,
        length: u64,
    ) -> Result<()> {
        let now = self.now();
        let record = {
            let mut bucket = self.index.lock(self.index.bucket_of(file_id));
            bucket.find_mut(file_id).and_then(|fq| {
                let record = fq.take_dispatched(direction, offset, length)?;
                if record.in_quantum {
                    fq.queue_mut(direction).quantum.note_release(now);
                }
                Some(record)
            })
        };

        let Some(record) = record else {
            // Pass-through dispatch already did the release bookkeeping.
            if self.active.kind() == PolicyKind::Noop {
                return Ok(());
            }
            self.stats.not_found.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Release of unknown request {} {} offset={} length={}",
                file_id,
                direction.as_str(),
                offset,
                length
            );
            return Err(Error::not_found(file_id, direction, offset, length));
        };

        self.note_release(length);
        if record.synchronous && self.outstanding_sync.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _ = self.ack_tx.try_send(());
        }
        debug!(
            "Released {} {} offset={} length={} after {}ns",
            file_id,
            direction.as_str(),
            offset,
            length,
            now.saturating_sub(record.dispatched_at)
        );
        Ok(())
    }

    fn note_release(&self, length: u64) {
        self.stats.record_release(length);
        self.processed_since_selection.fetch_add(1, Ordering::Relaxed);
        self.bytes_since_selection
            .fetch_add(length, Ordering::Relaxed);
    }

    /// Withdraws a pending request. Already dispatched requests cannot be
    /// cancelled.
    pub fn cancel(
        &self,
        file_id: &str,
        direction: Direction,
        offset: u64,
        length: u64,
    ) -> Result<()> {
        let removed = loop {
            let snap = self.active.snapshot();
            if snap.kind.descriptor().needs_hashtable {
                let mut bucket = self.index.lock(self.index.bucket_of(file_id));
                if self.active.epoch() != snap.epoch {
                    drop(bucket);
                    self.stats.lock_retries.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                break bucket.remove(file_id, direction, offset, length, &self.counters);
            } else {
                let mut timeline = self.timeline.lock();
                if self.active.epoch() != snap.epoch {
                    drop(timeline);
                    self.stats.lock_retries.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let removed = timeline.cancel(file_id, direction, offset, length);
                if removed.is_some() {
                    let mut bucket = self.index.lock(self.index.bucket_of(file_id));
                    if let Some(fq) = bucket.find_mut(file_id) {
                        fq.note_timeline_remove(1, &self.counters);
                    }
                }
                break removed.ok_or_else(|| Error::not_found(file_id, direction, offset, length));
            }
        };

        match removed {
            Ok(request) => {
                self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Cancelled {} {} offset={} length={}",
                    request.file_id,
                    direction.as_str(),
                    offset,
                    length
                );
                Ok(())
            }
            Err(e) => {
                self.stats.not_found.fetch_add(1, Ordering::Relaxed);
                warn!("Cancel failed: {}", e);
                Err(e)
            }
        }
    }

    /// Moves pending requests to the index `new_kind` needs and installs it
    /// under a new epoch.
    pub fn migrate(&self, new_kind: PolicyKind) -> PolicySnapshot {
        let old_kind = self.active.kind();
        let old_desc = old_kind.descriptor();
        let new_desc = new_kind.descriptor();
        let max_aggregation = new_desc.effective_max_aggregation(&self.config);
        let old_order = old_desc.timeline_order(&self.config, self.max_stream_id);
        let new_order = new_desc.timeline_order(&self.config, self.max_stream_id);

        let mut timeline = self.timeline.lock();
        let mut buckets = self.index.lock_all();
        timeline.configure(new_order, max_aggregation);

        let mut moved = 0usize;
        match (old_desc.needs_hashtable, new_desc.needs_hashtable) {
            // Aggregates built under a larger ceiling are kept as they are.
            (true, true) => {}
            (true, false) => {
                for bucket in buckets.iter_mut() {
                    for node in bucket.drain() {
                        if let Some(fq) = bucket.find_mut(node.file_id()) {
                            fq.timeline_pending += node.count();
                        }
                        moved += node.count();
                        timeline.add(node);
                    }
                }
            }
            (false, true) => {
                for node in timeline.drain() {
                    let bucket = &mut buckets[self.index.bucket_of(node.file_id())];
                    if let Some(fq) = bucket.find_mut(node.file_id()) {
                        fq.timeline_pending = fq.timeline_pending.saturating_sub(node.count());
                    }
                    moved += node.count();
                    bucket.adopt(node, max_aggregation);
                }
            }
            (false, false) => {
                if old_order.is_priority() || new_order.is_priority() {
                    timeline.reorder();
                }
            }
        }

        let snap = self.active.advance(new_kind);
        drop(buckets);
        drop(timeline);

        self.stats.migrations.fetch_add(1, Ordering::Relaxed);
        info!(
            "Migrated scheduling policy {} -> {} ({} requests moved, epoch {})",
            old_kind.name(),
            new_kind.name(),
            moved,
            snap.epoch
        );
        self.notify_work();
        snap
    }

    /// Detaches pending entry `idx` and records it as dispatched. The caller
    /// holds the bucket lock and must deliver the returned requests after
    /// releasing it.
    pub fn dispatch_entry(
        &self,
        bucket: &mut Bucket,
        file_idx: usize,
        direction: Direction,
        idx: usize,
        policy: PolicyKind,
        in_quantum: bool,
    ) -> SubRequests {
        let node = bucket.take_entry(file_idx, direction, idx, &self.counters);
        self.finish_dispatch(&mut bucket.files[file_idx], node, policy, in_quantum)
    }

    fn finish_dispatch(
        &self,
        fq: &mut FileQueues,
        node: RequestNode,
        policy: PolicyKind,
        in_quantum: bool,
    ) -> SubRequests {
        let synchronous = policy.descriptor().synchronous;
        crate::log_dispatch!(
            policy.name(),
            fq.file_id,
            node.direction().as_str(),
            node.offset(),
            node.length(),
            node.count()
        );
        self.stats.record_dispatch(policy, node.count());
        if synchronous {
            self.outstanding_sync
                .fetch_add(node.count(), Ordering::AcqRel);
        }
        fq.record_dispatch(node, self.now(), in_quantum, synchronous)
    }

    /// Pops the timeline head and records it as dispatched.
    pub fn dispatch_timeline_head(&self, policy: PolicyKind) -> Option<SubRequests> {
        let mut timeline = self.timeline.lock();
        let node = timeline.pop_oldest()?;
        let file_id = Arc::clone(node.file_id());
        let mut bucket = self.index.lock(self.index.bucket_of(&file_id));
        let fq = bucket.find_or_create(&file_id);
        fq.note_timeline_remove(node.count(), &self.counters);
        Some(self.finish_dispatch(fq, node, policy, false))
    }

    /// Hands requests to the caller. Under a synchronous policy, blocks until
    /// every synchronously dispatched request has been released.
    pub fn deliver(&self, subs: &[Request], policy: PolicyKind) {
        if subs.is_empty() {
            return;
        }
        self.callbacks.deliver(subs);
        if policy.descriptor().synchronous {
            self.wait_for_release();
        }
    }

    fn wait_for_release(&self) {
        while self.outstanding_sync.load(Ordering::Acquire) > 0 {
            if self.is_stopping() {
                break;
            }
            let _ = self.ack_rx.recv_timeout(SYNC_POLL);
        }
    }

    pub fn report(&self) -> StatsReport {
        StatsReport {
            current_policy: self.active_policy().name().to_string(),
            pending_requests: self.counters.requests(),
            pending_files: self.counters.files(),
            global: self.stats.snapshot(),
            files: self.index.file_snapshots(),
        }
    }

    pub fn reset_statistics(&self) {
        self.stats.reset();
        self.index.reset_stats();
    }

    fn processed_since_selection(&self) -> u64 {
        self.processed_since_selection.load(Ordering::Relaxed)
    }

    /// Bytes released since the previous reselection; resets the period.
    fn take_period(&self) -> u64 {
        self.processed_since_selection.store(0, Ordering::Relaxed);
        self.bytes_since_selection.swap(0, Ordering::Relaxed)
    }
}

/// Policy objects owned by the scheduling thread.
pub struct PolicyRuntime {
    current: Box<dyn SchedulingPolicy>,
    meta: Option<Box<dyn MetaPolicy>>,
    bandwidth: BandwidthTracker,
    last_selection: u64,
}

impl PolicyRuntime {
    pub fn new(core: &SchedulerCore) -> Self {
        let start = core.config().starting_policy_kind();
        let bandwidth = BandwidthTracker::new(ms_to_ns(core.config().performance_validity_ms));
        let mut runtime = Self {
            current: policy::build(core.active_policy(), core),
            meta: None,
            bandwidth,
            last_selection: core.now(),
        };
        if start.descriptor().is_dynamic {
            runtime.install_meta(core, start);
        }
        runtime.current.init(core);
        runtime
    }

    pub fn current_kind(&self) -> PolicyKind {
        self.current.kind()
    }

    pub fn meta_kind(&self) -> Option<PolicyKind> {
        self.meta.as_ref().map(|m| m.kind())
    }

    fn install_meta(&mut self, core: &SchedulerCore, kind: PolicyKind) {
        let mut meta = dynamic::build(kind, core.config());
        let initial = meta.select_initial(core);
        info!("Meta-policy {} selected {}", kind.name(), initial.name());
        self.meta = Some(meta);
        self.last_selection = core.now();
        core.take_period();
        if initial != self.current.kind() {
            self.switch_to(core, initial);
        }
    }

    fn switch_to(&mut self, core: &SchedulerCore, kind: PolicyKind) {
        self.current.exit(core);
        core.migrate(kind);
        self.current = policy::build(kind, core);
        self.current.init(core);
    }

    /// Nanoseconds until the meta-policy's next reselection.
    pub fn until_reselection(&self, core: &SchedulerCore) -> Option<u64> {
        self.meta.as_ref()?;
        let period = ms_to_ns(core.config().select_period_ms);
        Some(
            self.last_selection
                .saturating_add(period)
                .saturating_sub(core.now()),
        )
    }

    /// CHECK_MIGRATION step of the dispatch loop.
    pub fn check_migration(&mut self, core: &SchedulerCore) {
        if let Some(forced) = core.take_forced_policy() {
            if forced.descriptor().is_dynamic {
                self.install_meta(core, forced);
            } else {
                self.meta = None;
                if forced != self.current.kind() {
                    self.switch_to(core, forced);
                }
            }
            return;
        }

        let Some(meta) = self.meta.as_mut() else {
            return;
        };
        let now = core.now();
        let elapsed = now.saturating_sub(self.last_selection);
        if elapsed < ms_to_ns(core.config().select_period_ms)
            || core.processed_since_selection() < core.config().min_requests_before_selection
        {
            return;
        }

        let current = self.current.kind();
        let bytes = core.take_period();
        self.bandwidth.record(current, bytes, elapsed, now);
        self.last_selection = now;

        let next = meta.select_next(core, &self.bandwidth, current);
        debug!(
            "Meta-policy {} reselected {} (was {})",
            meta.kind().name(),
            next.name(),
            current.name()
        );
        if next != current {
            self.switch_to(core, next);
        }
    }

    pub fn run_once(&mut self, core: &SchedulerCore) -> ScheduleOutcome {
        self.current.schedule(core)
    }

    pub fn bandwidth(&self) -> &BandwidthTracker {
        &self.bandwidth
    }
}

/// Body of the scheduling thread.
pub fn run_dispatch_loop(core: Arc<SchedulerCore>, mut runtime: PolicyRuntime) {
    info!(
        "Scheduler thread started with policy {}",
        runtime.current_kind().name()
    );
    let idle = Duration::from_millis(core.config().idle_timeout_ms.max(1));
    let mut backoff: Option<Duration> = None;

    while !core.is_stopping() {
        if core.counters().requests() == 0 {
            let timeout = runtime
                .until_reselection(&core)
                .map(|ns| idle.min(Duration::from_nanos(ns.max(1))))
                .unwrap_or(idle);
            core.wait_for_work(timeout);
            if core.is_stopping() {
                break;
            }
        } else if let Some(pause) = backoff.take() {
            core.wait_for_work(pause.min(idle));
        }

        runtime.check_migration(&core);

        let outcome = runtime.run_once(&core);
        if outcome.dispatched == 0 && core.counters().requests() > 0 {
            backoff = Some(
                outcome
                    .wait_ns
                    .map(Duration::from_nanos)
                    .unwrap_or(RETRY_PAUSE),
            );
        }
    }

    info!(
        "Scheduler thread stopped ({} requests still pending)",
        core.counters().requests()
    );
}
