#![allow(dead_code)]

use crossbeam::channel::{unbounded, RecvTimeoutError};
use lightning_iosched::scheduler::{Callbacks, SchedulerCore};
use lightning_iosched::{Direction, IoScheduler, PolicyKind, ProcessOne, Request, SchedulerConfig};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

pub const FAST_TEST_SIZE: u64 = 200;

pub fn config_for(policy: PolicyKind) -> SchedulerConfig {
    SchedulerConfig {
        default_policy: policy.name().to_string(),
        hash_buckets: 16,
        idle_timeout_ms: 5,
        refresh_interval_ms: 10,
        ..Default::default()
    }
}

/// Scheduler whose dispatched requests are recorded and acknowledged by a
/// simulated device thread.
pub struct TestScheduler {
    pub scheduler: Arc<IoScheduler>,
    pub dispatched: Arc<Mutex<Vec<Request>>>,
    pub batches: Arc<Mutex<Vec<usize>>>,
}

impl TestScheduler {
    pub fn start(config: SchedulerConfig, max_stream_id: u32) -> Self {
        let dispatched = Arc::new(Mutex::new(Vec::new()));
        let batches = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = unbounded::<Request>();

        let record = Arc::clone(&dispatched);
        let scheduler = Arc::new(
            IoScheduler::builder()
                .config(config)
                .max_stream_id(max_stream_id)
                .process_one(move |r: &Request| {
                    record.lock().push(r.clone());
                    let _ = tx.send(r.clone());
                })
                .start()
                .expect("Failed to start scheduler"),
        );

        spawn_device(Arc::downgrade(&scheduler), rx);
        Self {
            scheduler,
            dispatched,
            batches,
        }
    }

    /// Like `start`, with aggregates delivered through the batch callback.
    pub fn start_batched(config: SchedulerConfig) -> Self {
        let dispatched = Arc::new(Mutex::new(Vec::new()));
        let batches = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = unbounded::<Request>();

        let (one_record, one_tx) = (Arc::clone(&dispatched), tx.clone());
        let (many_record, many_batches) = (Arc::clone(&dispatched), Arc::clone(&batches));
        let scheduler = Arc::new(
            IoScheduler::builder()
                .config(config)
                .process_one(move |r: &Request| {
                    one_record.lock().push(r.clone());
                    let _ = one_tx.send(r.clone());
                })
                .process_many(move |subs: &[Request]| {
                    many_batches.lock().push(subs.len());
                    many_record.lock().extend(subs.iter().cloned());
                    for r in subs {
                        let _ = tx.send(r.clone());
                    }
                })
                .start()
                .expect("Failed to start scheduler"),
        );

        spawn_device(Arc::downgrade(&scheduler), rx);
        Self {
            scheduler,
            dispatched,
            batches,
        }
    }

    pub fn dispatched_count(&self) -> usize {
        self.dispatched.lock().len()
    }

    pub fn wait_for_dispatched(&self, n: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.dispatched_count() >= n)
    }

    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        wait_until(timeout, || {
            let report = self.scheduler.statistics();
            report.pending_requests == 0
                && report.global.released == report.global.dispatched_requests
        })
    }

    pub fn tokens(&self) -> Vec<u64> {
        self.dispatched.lock().iter().map(|r| r.token).collect()
    }
}

fn spawn_device(scheduler: Weak<IoScheduler>, rx: crossbeam::channel::Receiver<Request>) {
    thread::spawn(move || loop {
        match rx.recv_timeout(Duration::from_millis(20)) {
            Ok(r) => {
                let Some(scheduler) = scheduler.upgrade() else {
                    break;
                };
                let _ = scheduler.complete(&r.file_id, r.direction, r.offset, r.length);
            }
            Err(RecvTimeoutError::Timeout) => {
                if scheduler.strong_count() == 0 {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    });
}

/// Scheduler core without a scheduling thread, recording dispatches.
pub fn recording_core(config: SchedulerConfig) -> (SchedulerCore, Arc<Mutex<Vec<Request>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callbacks = Callbacks::new(
        Some(Box::new(move |r: &Request| sink.lock().push(r.clone())) as ProcessOne),
        None,
    )
    .expect("callback installed");
    (SchedulerCore::new(config, callbacks, 16), seen)
}

pub fn submit_all(core: &SchedulerCore, requests: &[(&str, Direction, u64, u64)]) {
    for (token, (file, direction, offset, length)) in requests.iter().enumerate() {
        core.submit(file, *direction, *offset, *length, token as u64, 0)
            .expect("submit");
    }
}

pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}
