//! Tracing setup for programs embedding the store.
//!
//! The library only emits `tracing` events; nothing is printed unless the
//! host installs a subscriber, either its own or the one below.

use tracing_subscriber::{fmt, EnvFilter};

/// Filter used when neither `TASKLOG_LOG` nor `RUST_LOG` is set.
pub const DEFAULT_FILTER: &str = "tasklog=info";

fn filter_from(tasklog_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    [tasklog_log, rust_log]
        .into_iter()
        .flatten()
        .find_map(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs a formatting subscriber filtered by `TASKLOG_LOG`, falling back
/// to `RUST_LOG`, then [`DEFAULT_FILTER`].
///
/// Returns false when a global subscriber was already installed; calling
/// this more than once is harmless.
pub fn init_tracing() -> bool {
    let filter = filter_from(
        std::env::var("TASKLOG_LOG").ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    );
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
