//! Status - ステータス表示用のビュー

use serde::Serialize;

use crate::domain::ServerStatus;
use crate::observability::{DispatcherCounts, QueueCounts};

/// Snapshot of the relay link for admin display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkStatusView {
    pub local: ServerStatus,
    pub remote: Option<ServerStatus>,
    pub call_attempts: u32,
    pub resync_counter: i64,
    /// Set while disconnected.
    pub next_call_time: Option<i64>,
    /// Set while connected.
    pub next_resync_time: Option<i64>,
    pub init_deadline: i64,
}

/// Everything one server reports about itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerReport {
    pub link: LinkStatusView,
    pub dispatcher: DispatcherCounts,
    pub queue: QueueCounts,
}
