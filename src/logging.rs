//! Structured logging setup (console + rolling file).

use std::path::Path;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize structured logging: console layer plus a daily-rolling
/// file under `log_dir`. Returns the appender guard, which must be held
/// for the lifetime of the process or buffered log lines are dropped.
///
/// Safe to call more than once; subsequent calls are no-ops.
pub fn init(log_dir: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,clinic_ops=debug"));

    let file_appender = tracing_appender::rolling::daily(log_dir, "clinic-ops");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let result = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .with(fmt::layer().json().with_writer(non_blocking))
        .try_init();

    match result {
        Ok(()) => Some(guard),
        // Another subscriber is already installed (tests, embedding app)
        Err(_) => None,
    }
}
