//! TaskQueue port: the persistent, time-ordered queue of pending tasks.
//!
//! # 設計原則
//! - `peek_ready` has no side effect and may be called every cycle.
//! - Everything that changes a task happens inside a `QueueTransaction`;
//!   `claim_ready` there is atomic with at most one winner per task.
//! - A transaction that is dropped without `commit` behaves as `rollback`.

use async_trait::async_trait;

use crate::domain::{LogEntry, NewTask, RecordKey, Task, TaskFilter};
use crate::observability::QueueCounts;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("task {0} not found")]
    NotFound(RecordKey),

    #[error("task {0} is claimed by another transaction")]
    Conflict(RecordKey),

    #[error("queue backend unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Insert a new task outside any transaction.
    async fn submit(&self, task: NewTask) -> Result<RecordKey, QueueError>;

    /// Earliest unclaimed task with `sched_time <= cutoff`, without claiming it.
    async fn peek_ready(&self, cutoff: i64) -> Result<Option<Task>, QueueError>;

    async fn begin(&self) -> Result<Box<dyn QueueTransaction>, QueueError>;

    /// Whether an audit record exists for `key`.
    async fn has_log(&self, key: RecordKey) -> Result<bool, QueueError>;

    /// Delete every queued, unclaimed task matching `filter`.
    async fn cancel_matching(&self, filter: &TaskFilter) -> Result<usize, QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;
}

#[async_trait]
pub trait QueueTransaction: Send {
    /// Atomically claim the earliest ready task, stamping `exec_time`.
    /// The returned task has `restarted` set if an earlier claim never finished.
    async fn claim_ready(&mut self, cutoff: i64, exec_time: i64)
    -> Result<Option<Task>, QueueError>;

    /// Re-insert `task` to run again at `exec_time` with a new stage and,
    /// optionally, a new event id.
    async fn stage(
        &mut self,
        task: &Task,
        exec_time: i64,
        stage: i32,
        event_id: Option<String>,
    ) -> Result<(), QueueError>;

    async fn delete(&mut self, task: &Task) -> Result<(), QueueError>;

    async fn submit(&mut self, task: NewTask) -> Result<RecordKey, QueueError>;

    async fn write_log(&mut self, entry: LogEntry) -> Result<(), QueueError>;

    /// Sees committed records and records written earlier in this transaction.
    async fn has_log(&mut self, key: RecordKey) -> Result<bool, QueueError>;

    async fn commit(self: Box<Self>) -> Result<(), QueueError>;

    async fn rollback(self: Box<Self>);
}
