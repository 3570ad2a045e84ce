//! Worker log output.
//!
//! Broker reconnects, job status changes and command starts are logged by the
//! library crates with a `job_id` field where one applies. The binary installs
//! one fmt subscriber for all of them.

use tracing_subscriber::EnvFilter;

/// Dependencies that log every frame or query at `info`
const QUIET_DEPENDENCIES: &[&str] = &["lapin=warn", "sqlx=warn"];

/// Installs the worker's subscriber at `level` (the `LOG_LEVEL` setting)
///
/// `RUST_LOG` replaces the whole filter when set. Calling this twice is a
/// no-op.
pub fn init_logging(level: &str) {
    use tracing_subscriber::fmt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| worker_filter(level));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .try_init();
}

fn worker_filter(level: &str) -> EnvFilter {
    let directives = std::iter::once(level)
        .chain(QUIET_DEPENDENCIES.iter().copied())
        .collect::<Vec<_>>()
        .join(",");
    EnvFilter::new(directives)
}
