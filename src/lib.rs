//! Lightning IoSched: an I/O request scheduler library.
//!
//! Callers submit file requests from any number of threads; a dedicated
//! scheduling thread aggregates contiguous requests, orders them with the
//! active scheduling policy and hands them back through a callback. Policies
//! can be switched at runtime, either explicitly or by a meta-policy that
//! measures how each one performs.
//!
//! ```no_run
//! use lightning_iosched::{Direction, IoScheduler, Request};
//!
//! let scheduler = IoScheduler::builder()
//!     .process_one(|r: &Request| println!("serve {} @{}", r.file_id, r.offset))
//!     .start()
//!     .unwrap();
//! scheduler.submit("data.bin", Direction::Read, 0, 4096, 1, 0).unwrap();
//! ```

pub mod access_time;
pub mod aggregation;
pub mod bandwidth;
pub mod clock;
pub mod config;
pub mod dynamic;
pub mod error;
pub mod file_queues;
pub mod hashtable;
pub mod logging;
pub mod policy;
pub mod request;
pub mod scheduler;
pub mod stats;
pub mod timeline;

pub use access_time::{AccessTimeModel, LinearAccessModel};
pub use config::SchedulerConfig;
pub use error::{Error, Result};
pub use policy::waiting::AggregationPredictor;
pub use policy::PolicyKind;
pub use request::{Direction, Request, Token};
pub use scheduler::{Callbacks, ProcessMany, ProcessOne};
pub use stats::{StatsReport, StatsSnapshot};

use parking_lot::Mutex;
use scheduler::{run_dispatch_loop, PolicyRuntime, SchedulerCore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

/// Handle to a running scheduler. Dropping it shuts the scheduler down.
pub struct IoScheduler {
    core: Arc<SchedulerCore>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IoScheduler {
    /// Starts a scheduler. `config_path` is optional; an unreadable or
    /// invalid file falls back to the defaults.
    pub fn init(
        process_one: Option<ProcessOne>,
        process_many: Option<ProcessMany>,
        config_path: Option<&Path>,
        max_stream_id: u32,
    ) -> Result<Self> {
        let mut builder = IoScheduler::builder().max_stream_id(max_stream_id);
        builder.process_one = process_one;
        builder.process_many = process_many;
        builder.config_path = config_path.map(Path::to_path_buf);
        builder.start()
    }

    pub fn builder() -> IoSchedulerBuilder {
        IoSchedulerBuilder::default()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.core.is_stopping() {
            Err(Error::ShuttingDown)
        } else {
            Ok(())
        }
    }

    pub fn submit(
        &self,
        file_id: &str,
        direction: Direction,
        offset: u64,
        length: u64,
        token: Token,
        stream_id: u32,
    ) -> Result<()> {
        self.core
            .submit(file_id, direction, offset, length, token, stream_id)
    }

    /// Acknowledges a request previously handed to the callback.
    pub fn complete(
        &self,
        file_id: &str,
        direction: Direction,
        offset: u64,
        length: u64,
    ) -> Result<()> {
        self.ensure_running()?;
        self.core.complete(file_id, direction, offset, length)
    }

    /// Withdraws a request that has not been dispatched yet.
    pub fn cancel(
        &self,
        file_id: &str,
        direction: Direction,
        offset: u64,
        length: u64,
    ) -> Result<()> {
        self.ensure_running()?;
        self.core.cancel(file_id, direction, offset, length)
    }

    pub fn current_policy(&self) -> PolicyKind {
        self.core.active_policy()
    }

    pub fn pending_requests(&self) -> usize {
        self.core.counters().requests()
    }

    /// Switches policy at the next reselection point. A meta-policy name
    /// installs that meta-policy; any other name disables the active one.
    pub fn set_policy(&self, kind: PolicyKind) -> Result<()> {
        self.ensure_running()?;
        self.core.force_policy(kind);
        Ok(())
    }

    pub fn statistics(&self) -> StatsReport {
        self.core.report()
    }

    pub fn reset_statistics(&self) {
        self.core.reset_statistics();
    }

    pub fn dump_statistics<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.core.report().write_to(path)
    }

    /// Stops the scheduling thread and waits for it. Requests still pending
    /// are dropped without being dispatched.
    pub fn shutdown(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        self.core.request_stop();
        if handle.join().is_err() {
            error!("Scheduler thread panicked");
        }
        info!("I/O scheduler shut down");
    }
}

impl Drop for IoScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Default)]
pub struct IoSchedulerBuilder {
    config: Option<SchedulerConfig>,
    config_path: Option<PathBuf>,
    process_one: Option<ProcessOne>,
    process_many: Option<ProcessMany>,
    max_stream_id: Option<u32>,
    access_model: Option<Arc<dyn AccessTimeModel>>,
    predictor: Option<Arc<dyn AggregationPredictor>>,
}

impl IoSchedulerBuilder {
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn process_one<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request) + Send + Sync + 'static,
    {
        self.process_one = Some(Box::new(f));
        self
    }

    pub fn process_many<F>(mut self, f: F) -> Self
    where
        F: Fn(&[Request]) + Send + Sync + 'static,
    {
        self.process_many = Some(Box::new(f));
        self
    }

    pub fn max_stream_id(mut self, max_stream_id: u32) -> Self {
        self.max_stream_id = Some(max_stream_id);
        self
    }

    pub fn access_model(mut self, model: Arc<dyn AccessTimeModel>) -> Self {
        self.access_model = Some(model);
        self
    }

    pub fn predictor(mut self, predictor: Arc<dyn AggregationPredictor>) -> Self {
        self.predictor = Some(predictor);
        self
    }

    fn resolve_config(&mut self) -> SchedulerConfig {
        match self.config.take() {
            Some(config) => match config.validate() {
                Ok(()) => config,
                Err(e) => {
                    warn!("Invalid scheduler configuration, using defaults: {}", e);
                    SchedulerConfig::default()
                }
            },
            None => SchedulerConfig::load_or_default(self.config_path.as_deref()),
        }
    }

    pub fn start(mut self) -> Result<IoScheduler> {
        let callbacks = Callbacks::new(self.process_one.take(), self.process_many.take())?;
        let config = self.resolve_config();
        let max_stream_id = self.max_stream_id.unwrap_or(1).max(1);

        let mut core = SchedulerCore::new(config, callbacks, max_stream_id);
        if let Some(model) = self.access_model.take() {
            core = core.with_access_model(model);
        }
        if let Some(predictor) = self.predictor.take() {
            core = core.with_predictor(predictor);
        }
        let core = Arc::new(core);

        let runtime = PolicyRuntime::new(&core);
        info!(
            "I/O scheduler starting: policy {}, meta-policy {:?}, {} buckets",
            runtime.current_kind().name(),
            runtime.meta_kind().map(PolicyKind::name),
            core.index().bucket_count()
        );

        let worker_core = Arc::clone(&core);
        let handle = thread::Builder::new()
            .name("iosched-dispatch".to_string())
            .spawn(move || run_dispatch_loop(worker_core, runtime))
            .map_err(|e| Error::Allocation(format!("failed to spawn scheduler thread: {}", e)))?;

        Ok(IoScheduler {
            core,
            worker: Mutex::new(Some(handle)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[test]
    fn test_init_requires_a_callback() {
        assert!(matches!(
            IoScheduler::init(None, None, None, 1),
            Err(Error::NoCallback)
        ));
    }

    #[test]
    fn test_missing_config_file_falls_back() {
        let scheduler = IoScheduler::init(
            Some(Box::new(|_: &Request| {}) as ProcessOne),
            None,
            Some(Path::new("/nonexistent/iosched.json")),
            4,
        )
        .unwrap();
        assert_eq!(scheduler.current_policy(), PolicyKind::Aioli);
        scheduler.shutdown();
        scheduler.shutdown();
    }

    #[test]
    fn test_requests_reach_callback() {
        let served = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&served);
        let scheduler = IoScheduler::builder()
            .config(SchedulerConfig {
                default_policy: "MLF".to_string(),
                ..Default::default()
            })
            .process_one(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .start()
            .unwrap();

        for i in 0..10 {
            scheduler
                .submit("f", Direction::Write, i * 4096, 4096, i, 0)
                .unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while served.load(Ordering::SeqCst) < 10 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(served.load(Ordering::SeqCst), 10);
        assert_eq!(scheduler.pending_requests(), 0);

        scheduler.shutdown();
        assert!(matches!(
            scheduler.submit("f", Direction::Write, 0, 1, 0, 0),
            Err(Error::ShuttingDown)
        ));
    }
}
