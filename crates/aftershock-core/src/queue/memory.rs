//! In-memory task queue with explicit transactions.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::record::{QueueRecord, TxId};
use crate::domain::{LogEntry, NewTask, RecordKey, Task, TaskFilter};
use crate::observability::QueueCounts;
use crate::ports::{KeyGenerator, QueueError, QueueTransaction, TaskQueue};

/// In-memory queue state.
#[derive(Default)]
struct QueueState {
    /// All pending tasks (single source of truth).
    records: BTreeMap<RecordKey, QueueRecord>,

    /// Audit log, keyed by the key of the task it describes.
    logs: BTreeMap<RecordKey, LogEntry>,
}

impl QueueState {
    fn earliest_ready(&self, cutoff: i64) -> Option<RecordKey> {
        self.records
            .values()
            .filter(|r| r.is_ready(cutoff))
            .min_by_key(|r| r.order_key())
            .map(|r| r.task.key)
    }

    fn release_all(&mut self, tx: TxId) {
        for record in self.records.values_mut() {
            record.release(tx);
        }
    }

    fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for record in self.records.values() {
            if record.held_by.is_some() {
                counts.claimed += 1;
            } else {
                counts.queued += 1;
            }
            if record.task.stage > 0 {
                counts.staged += 1;
            }
        }
        counts.logged = self.logs.len();
        counts
    }
}

fn lock(state: &Mutex<QueueState>) -> MutexGuard<'_, QueueState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory `TaskQueue`.
///
/// Clones share the same storage, which is how the two servers of the demo
/// and the tests see one database.
#[derive(Clone)]
pub struct InMemoryTaskQueue {
    state: Arc<Mutex<QueueState>>,
    keys: Arc<dyn KeyGenerator>,
    next_tx: Arc<AtomicU64>,
}

impl InMemoryTaskQueue {
    pub fn new(keys: Arc<dyn KeyGenerator>) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            keys,
            next_tx: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn log_entries(&self) -> Vec<LogEntry> {
        lock(&self.state).logs.values().cloned().collect()
    }

    /// Snapshot of all pending tasks in ready order.
    pub fn tasks(&self) -> Vec<Task> {
        let state = lock(&self.state);
        let mut records: Vec<&QueueRecord> = state.records.values().collect();
        records.sort_by_key(|r| r.order_key());
        records.into_iter().map(|r| r.task.clone()).collect()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn submit(&self, task: NewTask) -> Result<RecordKey, QueueError> {
        let key = self.keys.generate_record_key();
        lock(&self.state)
            .records
            .insert(key, QueueRecord::new(task.into_task(key)));
        Ok(key)
    }

    async fn peek_ready(&self, cutoff: i64) -> Result<Option<Task>, QueueError> {
        let state = lock(&self.state);
        Ok(state
            .earliest_ready(cutoff)
            .and_then(|key| state.records.get(&key))
            .map(|r| r.task.clone()))
    }

    async fn begin(&self) -> Result<Box<dyn QueueTransaction>, QueueError> {
        Ok(Box::new(InMemoryTransaction {
            id: self.next_tx.fetch_add(1, Ordering::SeqCst),
            state: Arc::clone(&self.state),
            keys: Arc::clone(&self.keys),
            ops: Vec::new(),
            finished: false,
        }))
    }

    async fn has_log(&self, key: RecordKey) -> Result<bool, QueueError> {
        Ok(lock(&self.state).logs.contains_key(&key))
    }

    async fn cancel_matching(&self, filter: &TaskFilter) -> Result<usize, QueueError> {
        let mut state = lock(&self.state);
        let before = state.records.len();
        state
            .records
            .retain(|_, r| r.held_by.is_some() || !filter.matches(&r.task));
        Ok(before - state.records.len())
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        Ok(lock(&self.state).counts())
    }
}

/// Buffered write, applied on commit.
#[derive(Debug)]
enum PendingOp {
    Stage {
        key: RecordKey,
        sched_time: i64,
        stage: i32,
        event_id: Option<String>,
    },
    Delete(RecordKey),
    Submit(Task),
    Log(LogEntry),
}

/// Transaction over `InMemoryTaskQueue`.
///
/// Claims take effect immediately (that is what makes them exclusive); every
/// other write is buffered and applied atomically by `commit`.
struct InMemoryTransaction {
    id: TxId,
    state: Arc<Mutex<QueueState>>,
    keys: Arc<dyn KeyGenerator>,
    ops: Vec<PendingOp>,
    finished: bool,
}

impl InMemoryTransaction {
    /// A write to `key` is allowed unless another transaction holds it.
    fn check_writable(&self, key: RecordKey) -> Result<(), QueueError> {
        let state = lock(&self.state);
        match state.records.get(&key) {
            None => Err(QueueError::NotFound(key)),
            Some(record) if record.held_by.is_some_and(|tx| tx != self.id) => {
                Err(QueueError::Conflict(key))
            }
            Some(_) => Ok(()),
        }
    }
}

#[async_trait]
impl QueueTransaction for InMemoryTransaction {
    async fn claim_ready(
        &mut self,
        cutoff: i64,
        exec_time: i64,
    ) -> Result<Option<Task>, QueueError> {
        let mut state = lock(&self.state);
        let Some(key) = state.earliest_ready(cutoff) else {
            return Ok(None);
        };
        Ok(state.records.get_mut(&key).map(|r| r.claim(self.id, exec_time)))
    }

    async fn stage(
        &mut self,
        task: &Task,
        exec_time: i64,
        stage: i32,
        event_id: Option<String>,
    ) -> Result<(), QueueError> {
        self.check_writable(task.key)?;
        self.ops.push(PendingOp::Stage {
            key: task.key,
            sched_time: exec_time,
            stage,
            event_id,
        });
        Ok(())
    }

    async fn delete(&mut self, task: &Task) -> Result<(), QueueError> {
        self.check_writable(task.key)?;
        self.ops.push(PendingOp::Delete(task.key));
        Ok(())
    }

    async fn submit(&mut self, task: NewTask) -> Result<RecordKey, QueueError> {
        let key = self.keys.generate_record_key();
        self.ops.push(PendingOp::Submit(task.into_task(key)));
        Ok(key)
    }

    async fn write_log(&mut self, entry: LogEntry) -> Result<(), QueueError> {
        self.ops.push(PendingOp::Log(entry));
        Ok(())
    }

    async fn has_log(&mut self, key: RecordKey) -> Result<bool, QueueError> {
        let pending = self
            .ops
            .iter()
            .any(|op| matches!(op, PendingOp::Log(entry) if entry.key == key));
        Ok(pending || lock(&self.state).logs.contains_key(&key))
    }

    async fn commit(mut self: Box<Self>) -> Result<(), QueueError> {
        let mut state = lock(&self.state);
        for op in self.ops.drain(..) {
            match op {
                PendingOp::Stage {
                    key,
                    sched_time,
                    stage,
                    event_id,
                } => {
                    if let Some(record) = state.records.get_mut(&key) {
                        record.restage(sched_time, stage, event_id);
                    }
                }
                PendingOp::Delete(key) => {
                    state.records.remove(&key);
                }
                PendingOp::Submit(task) => {
                    state.records.insert(task.key, QueueRecord::new(task));
                }
                PendingOp::Log(entry) => {
                    state.logs.insert(entry.key, entry);
                }
            }
        }
        state.release_all(self.id);
        drop(state);
        self.finished = true;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) {
        self.ops.clear();
        lock(&self.state).release_all(self.id);
        self.finished = true;
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            lock(&self.state).release_all(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Opcode, Rescode};
    use crate::ports::{FixedClock, UlidKeyGenerator};

    fn queue() -> InMemoryTaskQueue {
        InMemoryTaskQueue::new(Arc::new(UlidKeyGenerator::new(Arc::new(FixedClock::from_millis(
            1_700_000_000_000,
        )))))
    }

    #[tokio::test]
    async fn peek_has_no_side_effect() {
        let q = queue();
        q.submit(NewTask::new("ev", Opcode::GEN_TIMELINE, 1_000)).await.unwrap();
        let a = q.peek_ready(2_000).await.unwrap().unwrap();
        let b = q.peek_ready(2_000).await.unwrap().unwrap();
        assert_eq!(a, b);
        assert_eq!(q.counts().await.unwrap().queued, 1);
        assert!(q.peek_ready(999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ready_order_is_sched_then_submit_time() {
        let q = queue();
        q.submit(NewTask::new("late", Opcode::NO_OP, 5_000)).await.unwrap();
        q.submit(NewTask::new("b", Opcode::NO_OP, 1_000).with_submit(20, "x")).await.unwrap();
        q.submit(NewTask::new("a", Opcode::NO_OP, 1_000).with_submit(10, "x")).await.unwrap();

        let order: Vec<String> = q.tasks().into_iter().map(|t| t.event_id).collect();
        assert_eq!(order, ["a", "b", "late"]);
        assert_eq!(q.peek_ready(10_000).await.unwrap().unwrap().event_id, "a");
    }

    #[tokio::test]
    async fn at_most_one_claim_wins() {
        let q = queue();
        q.submit(NewTask::new("ev", Opcode::GEN_TIMELINE, 1_000)).await.unwrap();

        let mut txs = Vec::new();
        for _ in 0..5 {
            txs.push(q.begin().await.unwrap());
        }
        let mut winners = 0;
        for tx in txs.iter_mut() {
            if tx.claim_ready(2_000, 2_000).await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn rollback_makes_task_claimable_again_as_restart() {
        let q = queue();
        q.submit(NewTask::new("ev", Opcode::GEN_TIMELINE, 1_000)).await.unwrap();

        let mut tx = q.begin().await.unwrap();
        let first = tx.claim_ready(2_000, 2_000).await.unwrap().unwrap();
        assert!(!first.restarted);
        tx.delete(&first).await.unwrap();
        tx.rollback().await;

        let mut tx = q.begin().await.unwrap();
        let second = tx.claim_ready(2_000, 3_000).await.unwrap().unwrap();
        assert_eq!(second.key, first.key);
        assert!(second.restarted);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_transaction_releases_claim() {
        let q = queue();
        q.submit(NewTask::new("ev", Opcode::GEN_TIMELINE, 1_000)).await.unwrap();
        {
            let mut tx = q.begin().await.unwrap();
            tx.claim_ready(2_000, 2_000).await.unwrap().unwrap();
            assert_eq!(q.counts().await.unwrap().claimed, 1);
        }
        assert!(q.peek_ready(2_000).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn commit_applies_log_and_delete_together() {
        let q = queue();
        q.submit(NewTask::new("ev", Opcode::GEN_TIMELINE, 1_000)).await.unwrap();

        let mut tx = q.begin().await.unwrap();
        let task = tx.claim_ready(2_000, 2_000).await.unwrap().unwrap();
        tx.write_log(LogEntry::for_task(&task, Rescode::Success, "ok", 2_000)).await.unwrap();
        assert!(tx.has_log(task.key).await.unwrap());
        assert!(!q.has_log(task.key).await.unwrap());
        tx.delete(&task).await.unwrap();
        tx.commit().await.unwrap();

        assert!(q.has_log(task.key).await.unwrap());
        assert!(q.tasks().is_empty());
        assert_eq!(q.log_entries()[0].rescode, Rescode::Success);
    }

    #[tokio::test]
    async fn stage_reschedules_with_new_event_id() {
        let q = queue();
        q.submit(NewTask::new("ev", Opcode::GEN_PDL_REPORT, 1_000)).await.unwrap();

        let mut tx = q.begin().await.unwrap();
        let task = tx.claim_ready(2_000, 2_000).await.unwrap().unwrap();
        tx.stage(&task, 9_000, 2, Some("ev-b".to_string())).await.unwrap();
        tx.commit().await.unwrap();

        assert!(q.peek_ready(8_999).await.unwrap().is_none());
        let staged = q.peek_ready(9_000).await.unwrap().unwrap();
        assert_eq!(staged.key, task.key);
        assert_eq!(staged.stage, 2);
        assert_eq!(staged.event_id, "ev-b");

        let mut tx = q.begin().await.unwrap();
        assert!(!tx.claim_ready(9_000, 9_000).await.unwrap().unwrap().restarted);
    }

    #[tokio::test]
    async fn writes_to_a_task_claimed_elsewhere_conflict() {
        let q = queue();
        q.submit(NewTask::new("ev", Opcode::GEN_TIMELINE, 1_000)).await.unwrap();

        let mut holder = q.begin().await.unwrap();
        let task = holder.claim_ready(2_000, 2_000).await.unwrap().unwrap();

        let mut other = q.begin().await.unwrap();
        assert!(matches!(other.delete(&task).await, Err(QueueError::Conflict(_))));
    }

    #[tokio::test]
    async fn cancel_matching_skips_claimed_tasks() {
        let q = queue();
        q.submit(NewTask::new("a", Opcode::GEN_PDL_REPORT, 1_000)).await.unwrap();
        q.submit(NewTask::new("b", Opcode::GEN_PDL_REPORT, 2_000)).await.unwrap();
        q.submit(NewTask::new("c", Opcode::GEN_TIMELINE, 3_000)).await.unwrap();

        let mut tx = q.begin().await.unwrap();
        tx.claim_ready(1_000, 1_000).await.unwrap().unwrap();

        let removed = q
            .cancel_matching(&TaskFilter::opcodes([Opcode::GEN_PDL_REPORT]))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        tx.rollback().await;

        let left: Vec<String> = q.tasks().into_iter().map(|t| t.event_id).collect();
        assert_eq!(left, ["a", "c"]);
    }
}
