//! Observability: tracing setup and counters for status display.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Pending tasks nobody holds.
    pub queued: usize,
    /// Tasks claimed by an open transaction.
    pub claimed: usize,
    /// Pending tasks with `stage > 0`.
    pub staged: usize,
    /// Audit log entries.
    pub logged: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherCounts {
    pub tasks_run: u64,
    pub forced_idles: u64,
    pub idle_cycles: u64,
    pub restarts: u64,
}
