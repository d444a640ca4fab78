//! Queue record: a task plus its claim bookkeeping.

use crate::domain::{RecordKey, Task};

/// Identifies the transaction holding a claim.
pub type TxId = u64;

/// A task as stored by the queue.
///
/// Design:
/// - `activated` is the durable claim mark. It survives rollback, so a task
///   whose attempt never finished comes back flagged `restarted`.
/// - `held_by` is the live claim of an open transaction; it never survives
///   the transaction.
#[derive(Debug, Clone)]
pub struct QueueRecord {
    pub task: Task,
    pub activated: bool,
    pub held_by: Option<TxId>,
}

impl QueueRecord {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            activated: false,
            held_by: None,
        }
    }

    /// Ready-queue order: scheduled time, then submit time, then key.
    pub fn order_key(&self) -> (i64, i64, RecordKey) {
        (self.task.sched_time, self.task.submit_time, self.task.key)
    }

    pub fn is_ready(&self, cutoff: i64) -> bool {
        self.held_by.is_none() && self.task.sched_time <= cutoff
    }

    /// Take the claim for `tx` and return the task as the claimant sees it.
    pub fn claim(&mut self, tx: TxId, exec_time: i64) -> Task {
        self.task.restarted = self.activated;
        self.task.exec_time = Some(exec_time);
        self.activated = true;
        self.held_by = Some(tx);
        self.task.clone()
    }

    pub fn release(&mut self, tx: TxId) {
        if self.held_by == Some(tx) {
            self.held_by = None;
        }
    }

    /// Re-insert for another run at `sched_time`.
    pub fn restage(&mut self, sched_time: i64, stage: i32, event_id: Option<String>) {
        self.task.sched_time = sched_time;
        self.task.stage = stage;
        if let Some(event_id) = event_id {
            self.task.event_id = event_id;
        }
        self.task.exec_time = None;
        self.task.restarted = false;
        self.activated = false;
    }
}
