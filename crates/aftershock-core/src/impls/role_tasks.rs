//! TaskRoleListener - 役割変更時のタスク整理
//!
//! On every role flip, queued tasks that only make sense under the previous
//! role are cancelled and an announcement task for the new role is queued.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::domain::{NewTask, Opcode, SCHED_TIME_PROMPT_MIN, TaskFilter};
use crate::ports::{DbHandle, RoleListener};

#[derive(Debug, Clone)]
pub struct TaskRoleListener {
    /// Cancelled when this server becomes primary.
    pub secondary_only: TaskFilter,
    /// Cancelled when this server becomes secondary.
    pub primary_only: TaskFilter,
    pub announce: bool,
}

impl Default for TaskRoleListener {
    fn default() -> Self {
        Self {
            secondary_only: TaskFilter::opcodes([Opcode::ANNOUNCE_SECONDARY]),
            primary_only: TaskFilter::opcodes([Opcode::ANNOUNCE_PRIMARY]),
            announce: true,
        }
    }
}

impl TaskRoleListener {
    async fn switch(&self, db: &DbHandle, stale: &TaskFilter, announce: Opcode) {
        match db.tasks.cancel_matching(stale).await {
            Ok(0) => {}
            Ok(n) => info!(cancelled = n, "cancelled tasks queued under the previous role"),
            Err(e) => warn!(error = %e, "failed to cancel tasks after role change"),
        }
        if self.announce {
            let task = NewTask::new("", announce, SCHED_TIME_PROMPT_MIN);
            if let Err(e) = db.tasks.submit(task).await {
                warn!(error = %e, %announce, "failed to queue role announcement");
            }
        }
    }
}

#[async_trait]
impl RoleListener for TaskRoleListener {
    async fn on_primary(&self, db: &DbHandle) {
        self.switch(db, &self.secondary_only, Opcode::ANNOUNCE_PRIMARY).await;
    }

    async fn on_secondary(&self, db: &DbHandle) {
        self.switch(db, &self.primary_only, Opcode::ANNOUNCE_SECONDARY).await;
    }
}
