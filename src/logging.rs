use tracing::Level;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

/// Initialize scheduler logging. `RUST_LOG` overrides `level`.
///
/// Safe to call more than once: later calls leave the first subscriber in place.
pub fn init_logging(level: Level, json_output: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("lightning_iosched={},warn", level)));

    if json_output {
        let fmt_layer = fmt::layer()
            .json()
            .with_timer(SystemTime)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true);

        let _ = Registry::default().with(env_filter).with(fmt_layer).try_init();
    } else {
        let fmt_layer = fmt::layer()
            .with_timer(SystemTime)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(true);

        let _ = Registry::default().with(env_filter).with(fmt_layer).try_init();
    }
}

/// Structured event for one dispatched entry.
#[macro_export]
macro_rules! log_dispatch {
    ($policy:expr, $file:expr, $direction:expr, $offset:expr, $length:expr, $count:expr) => {
        tracing::debug!(
            policy = $policy,
            file = %$file,
            direction = $direction,
            offset = $offset,
            length = $length,
            count = $count,
            "Dispatching request"
        )
    };
}
