//! TaskDispatcher - タスク実行ループ
//!
//! One dispatcher per process runs tasks strictly one at a time:
//! poll the relay link, peek for a ready task, then either claim and run it
//! inside a queue transaction or spend the cycle on idle callbacks.
//!
//! # 設計原則
//! - A task's handler and every queue change it causes commit together or
//!   not at all.
//! - A restarted task that already has an audit record is deleted without
//!   running its handler again.
//! - Failures after the first connection restart the loop with backoff;
//!   a failed first connection is returned to the caller.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::app::handler::{DispatchContext, HandlerError, HandlerTable, Route, Staging};
use crate::app::relay_link::{MergeError, RelayLink};
use crate::app::status::ServerReport;
use crate::config::{ConfigHandle, ServerConfig, as_ms};
use crate::domain::{
    DispatcherState, LogEntry, Opcode, PrimaryState, RecordKey, RelayId, RelayMode, Rescode, Task,
};
use crate::observability::DispatcherCounts;
use crate::ports::{
    Clock, ConnectError, Connector, DbHandle, QueueError, QueueTransaction, RelayStoreError,
};
use crate::queue::RestartPolicy;

#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error("first connection to the database failed: {0}")]
    FirstConnect(#[source] ConnectError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    RelayStore(#[from] RelayStoreError),

    #[error("handler for {opcode} failed on task {key}: {source}")]
    Handler {
        opcode: Opcode,
        key: RecordKey,
        #[source]
        source: HandlerError,
    },

    #[error("relay item {relay_id} from task {key} was rejected: {source}")]
    Relay {
        relay_id: RelayId,
        key: RecordKey,
        #[source]
        source: MergeError,
    },

    #[error("dispatcher is not connected")]
    NotConnected,
}

/// Result of one `run_cycle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    RanTask,
    /// Idle callbacks ran although a task was ready.
    ForcedIdle,
    /// Nothing was ready; the caller should wait `sleep` before the next cycle.
    Idle { sleep: Duration },
    Shutdown,
}

/// What idle callbacks get to work with.
pub struct IdleContext<'a> {
    pub db: &'a DbHandle,
    pub clock: &'a dyn Clock,
    pub primary_state: PrimaryState,
}

#[async_trait]
pub trait IdleCallback: Send {
    /// Returns true if any work was done.
    async fn on_idle(&mut self, cx: &IdleContext<'_>) -> bool;
}

/// Requests a clean stop from outside the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl DispatcherHandle {
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.tx.send(true);
    }
}

#[derive(Deserialize)]
struct RelayModeDetails {
    relay_mode: String,
    configured_primary: u8,
}

#[derive(Deserialize)]
struct HealthDetails {
    health_status: u32,
}

pub struct TaskDispatcher {
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
    database: Arc<dyn Connector>,
    link: RelayLink,
    handlers: HandlerTable,
    idle_callbacks: Vec<Box<dyn IdleCallback>>,

    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    /// Set by the `SHUTDOWN` opcode.
    shutdown_task_seen: bool,

    db: Option<DbHandle>,
    state: DispatcherState,
    /// Consecutive cycles that found a ready task, capped at the force threshold.
    idle_state: u32,
    idle_force_time: i64,
    last_restart: i64,
    counts: DispatcherCounts,
}

impl TaskDispatcher {
    pub fn new(
        config: ConfigHandle,
        clock: Arc<dyn Clock>,
        database: Arc<dyn Connector>,
        link: RelayLink,
        handlers: HandlerTable,
        idle_callbacks: Vec<Box<dyn IdleCallback>>,
    ) -> Self {
        let (tx, shutdown_rx) = watch::channel(false);
        let now = clock.true_ms();
        Self {
            config,
            clock,
            database,
            link,
            handlers,
            idle_callbacks,
            shutdown_tx: Arc::new(tx),
            shutdown_rx,
            shutdown_task_seen: false,
            db: None,
            state: DispatcherState::Initial,
            idle_state: 0,
            idle_force_time: now,
            last_restart: now,
            counts: DispatcherCounts::default(),
        }
    }

    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    pub fn state(&self) -> DispatcherState {
        self.state
    }

    pub fn counts(&self) -> &DispatcherCounts {
        &self.counts
    }

    pub fn link(&self) -> &RelayLink {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut RelayLink {
        &mut self.link
    }

    pub fn db(&self) -> Option<&DbHandle> {
        self.db.as_ref()
    }

    pub async fn report(&self) -> Result<ServerReport, DispatcherError> {
        let db = self.db.as_ref().ok_or(DispatcherError::NotConnected)?;
        Ok(ServerReport {
            link: self.link.status_snapshot(),
            dispatcher: self.counts.clone(),
            queue: db.tasks.counts().await?,
        })
    }

    /// Run until shutdown.
    pub async fn run(&mut self) -> Result<(), DispatcherError> {
        self.connect_first().await?;
        loop {
            match self.session().await {
                Ok(()) => break,
                Err(e) => {
                    error!(error = %e, state = %self.state, "dispatcher loop failed");
                    if !self.wait_for_restart().await {
                        break;
                    }
                }
            }
        }
        self.finish().await;
        Ok(())
    }

    /// First connection plus relay link startup. The connection error is final.
    pub async fn start(&mut self) -> Result<(), DispatcherError> {
        self.connect_first().await?;
        self.attach().await
    }

    /// One dispatcher cycle. Does not sleep.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, DispatcherError> {
        if self.shutdown_requested() {
            return Ok(CycleOutcome::Shutdown);
        }
        let cfg = self.config.current();
        let db = self.db.clone().ok_or(DispatcherError::NotConnected)?;
        let cycle_start = self.clock.true_ms();

        self.set_state(DispatcherState::RelayLinkPoll);
        self.link.poll(&db).await?;

        self.set_state(DispatcherState::Polling);
        let cutoff = self.clock.effective_ms();
        let ready = db.tasks.peek_ready(cutoff).await?;

        let force_idle = match &ready {
            Some(task) => self.should_force_idle(&cfg, task),
            None => {
                self.idle_state = 0;
                false
            }
        };

        if ready.is_some() && !force_idle && self.process_one(&db, cutoff).await? {
            self.counts.tasks_run += 1;
            if self.shutdown_requested() {
                return Ok(CycleOutcome::Shutdown);
            }
            return Ok(CycleOutcome::RanTask);
        }

        self.set_state(DispatcherState::IdleTime);
        let worked = self.run_idle(&db).await;
        let now = self.clock.true_ms();
        let delay = if worked {
            cfg.dispatcher.idle_force_short_delay
        } else {
            cfg.dispatcher.idle_force_long_delay
        };
        self.idle_force_time = now.saturating_add(as_ms(delay));

        if force_idle {
            self.idle_state = 0;
            self.counts.forced_idles += 1;
            info!(worked, "forced idle time while tasks are waiting");
            return Ok(CycleOutcome::ForcedIdle);
        }

        self.counts.idle_cycles += 1;
        let elapsed = (now - cycle_start).max(0);
        let sleep_ms =
            (as_ms(cfg.dispatcher.polling_delay) - elapsed).max(as_ms(cfg.dispatcher.min_sleep));
        Ok(CycleOutcome::Idle {
            sleep: Duration::from_millis(u64::try_from(sleep_ms).unwrap_or(0)),
        })
    }

    fn should_force_idle(&mut self, cfg: &ServerConfig, task: &Task) -> bool {
        let limit = cfg.dispatcher.idle_force_task_count;
        if self.idle_state < limit {
            self.idle_state += 1;
            return false;
        }
        self.clock.true_ms() >= self.idle_force_time
            && !task.is_early(cfg.dispatcher.early_task_limit)
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown_task_seen || *self.shutdown_rx.borrow()
    }

    fn set_state(&mut self, state: DispatcherState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "dispatcher state");
            self.state = state;
        }
    }

    async fn connect_first(&mut self) -> Result<(), DispatcherError> {
        self.set_state(DispatcherState::FirstConnect);
        match self.database.connect().await {
            Ok(db) => {
                self.db = Some(db);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "first database connection failed; not retrying");
                Err(DispatcherError::FirstConnect(e))
            }
        }
    }

    /// Bring up the relay link and wait, bounded, for a role.
    async fn attach(&mut self) -> Result<(), DispatcherError> {
        let db = self.db.clone().ok_or(DispatcherError::NotConnected)?;
        let cfg = self.config.current();

        self.set_state(DispatcherState::RelayLinkInit);
        self.link.init(&db).await?;
        let timeout = Duration::from_millis(cfg.negotiation.prist_init_timeout);
        let role = self.link.wait_for_role(&db, timeout).await?;
        info!(server_number = self.link.server_number(), %role, "dispatcher attached");

        self.idle_state = 0;
        self.idle_force_time = self
            .clock
            .true_ms()
            .saturating_add(as_ms(cfg.dispatcher.idle_force_short_delay));
        Ok(())
    }

    async fn session(&mut self) -> Result<(), DispatcherError> {
        if self.db.is_none() {
            self.set_state(DispatcherState::Reconnecting);
            self.db = Some(self.database.connect().await?);
        }
        self.attach().await?;
        loop {
            match self.run_cycle().await? {
                CycleOutcome::Shutdown => return Ok(()),
                CycleOutcome::RanTask | CycleOutcome::ForcedIdle => {}
                CycleOutcome::Idle { sleep } => {
                    self.set_state(DispatcherState::Waiting);
                    tokio::select! {
                        _ = tokio::time::sleep(sleep) => {}
                        _ = self.shutdown_rx.changed() => {}
                    }
                }
            }
        }
    }

    /// Backoff before the next session. Returns false if shutdown was
    /// requested meanwhile.
    async fn wait_for_restart(&mut self) -> bool {
        let cfg = self.config.current();
        let now = self.clock.true_ms();
        let since_last = u64::try_from(now - self.last_restart).unwrap_or(0);
        let delay = RestartPolicy::from_config(&cfg.dispatcher)
            .restart_delay(Duration::from_millis(since_last));
        self.last_restart = now;
        self.counts.restarts += 1;
        self.db = None;
        warn!(
            delay_ms = delay.as_millis() as u64,
            restarts = self.counts.restarts,
            "restarting dispatcher"
        );

        self.set_state(DispatcherState::Reconnecting);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.shutdown_rx.changed() => {}
        }
        !self.shutdown_requested()
    }

    async fn finish(&mut self) {
        self.set_state(DispatcherState::Shutdown);
        if let Some(db) = self.db.clone()
            && let Err(e) = self.link.shutdown(&db).await
        {
            warn!(error = %e, "final relay status was not written");
        }
        info!(tasks_run = self.counts.tasks_run, "dispatcher stopped");
    }

    async fn run_idle(&mut self, db: &DbHandle) -> bool {
        let cx = IdleContext {
            db,
            clock: self.clock.as_ref(),
            primary_state: self.link.primary_state(),
        };
        let mut worked = false;
        for callback in self.idle_callbacks.iter_mut() {
            worked |= callback.on_idle(&cx).await;
        }
        worked
    }

    /// Claim and run the earliest ready task. `Ok(false)` if another
    /// claimant got there first.
    async fn process_one(&mut self, db: &DbHandle, cutoff: i64) -> Result<bool, DispatcherError> {
        self.set_state(DispatcherState::Processing);
        let mut tx = db.tasks.begin().await?;
        let exec_time = self.clock.effective_ms();
        let Some(task) = tx.claim_ready(cutoff, exec_time).await? else {
            tx.rollback().await;
            return Ok(false);
        };

        let result = match self.dispatch(db, tx.as_mut(), &task).await {
            Ok(relay_items) => self.publish(db, &task, relay_items).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                tx.commit().await?;
                Ok(true)
            }
            Err(e) => {
                error!(?task, error = %e, "task failed; rolling back");
                tx.rollback().await;
                Err(e)
            }
        }
    }

    /// Relay items go out before the task commits; a rerun after a failed
    /// commit publishes them again.
    async fn publish(
        &mut self,
        db: &DbHandle,
        task: &Task,
        relay_items: Vec<(RelayId, Vec<u8>)>,
    ) -> Result<(), DispatcherError> {
        for (relay_id, payload) in relay_items {
            self.link
                .submit_relay_item(db, relay_id.clone(), payload)
                .await
                .map_err(|source| DispatcherError::Relay {
                    relay_id,
                    key: task.key,
                    source,
                })?;
        }
        Ok(())
    }

    async fn dispatch(
        &mut self,
        db: &DbHandle,
        tx: &mut dyn QueueTransaction,
        task: &Task,
    ) -> Result<Vec<(RelayId, Vec<u8>)>, DispatcherError> {
        if task.restarted && tx.has_log(task.key).await? {
            info!(
                key = %task.key,
                opcode = %task.opcode,
                "restarted task already completed; deleting"
            );
            tx.delete(task).await?;
            return Ok(Vec::new());
        }
        if task.restarted {
            warn!(key = %task.key, opcode = %task.opcode, "re-running interrupted task");
        }

        let mut cx = DispatchContext::new(tx, Arc::clone(&self.clock), self.link.primary_state());
        let rescode = match self.handlers.route(task.opcode) {
            Route::Handler(handler) => handler.handle(task, &mut cx).await.map_err(|source| {
                DispatcherError::Handler {
                    opcode: task.opcode,
                    key: task.key,
                    source,
                }
            })?,
            Route::Builtin => self.run_builtin(db, task, &mut cx).await?,
        };
        let outcome = cx.into_outcome();
        debug!(key = %task.key, opcode = %task.opcode, %rescode, "task handled");
        self.apply_rescode(tx, task, rescode, outcome.staging, outcome.remark).await?;
        Ok(outcome.relay_items)
    }

    async fn run_builtin(
        &mut self,
        db: &DbHandle,
        task: &Task,
        cx: &mut DispatchContext<'_>,
    ) -> Result<Rescode, DispatcherError> {
        let rescode = match task.opcode {
            Opcode::NO_OP => Rescode::Success,
            Opcode::SHUTDOWN => {
                info!(key = %task.key, "shutdown task received");
                self.shutdown_task_seen = true;
                Rescode::Delete
            }
            Opcode::SET_RELAY_MODE => {
                let parsed = serde_json::from_value::<RelayModeDetails>(task.details.clone())
                    .ok()
                    .and_then(|d| {
                        RelayMode::from_name(&d.relay_mode).map(|mode| (mode, d.configured_primary))
                    })
                    .filter(|(_, primary)| (1..=2).contains(primary));
                match parsed {
                    Some((mode, primary)) => {
                        let applied = self.link.set_relay_config(db, mode, primary).await?;
                        cx.set_remark(format!(
                            "relay mode {} with primary {} at timestamp {}",
                            applied.relay_mode, applied.configured_primary, applied.mode_timestamp
                        ));
                        Rescode::Success
                    }
                    None => {
                        warn!(key = %task.key, details = %task.details, "bad relay mode request");
                        cx.set_remark("bad relay mode details");
                        Rescode::TaskCorrupt
                    }
                }
            }
            Opcode::SET_HEALTH => {
                match serde_json::from_value::<HealthDetails>(task.details.clone()) {
                    Ok(d) => {
                        self.link.set_health(d.health_status);
                        cx.set_remark(format!("health status {}", d.health_status));
                        Rescode::Success
                    }
                    Err(e) => {
                        warn!(key = %task.key, error = %e, "bad health request");
                        cx.set_remark("bad health details");
                        Rescode::TaskCorrupt
                    }
                }
            }
            other => {
                warn!(opcode = %other, "opcode routed as built-in but has no built-in handling");
                Rescode::UnknownOpcode
            }
        };
        Ok(rescode)
    }

    async fn apply_rescode(
        &mut self,
        tx: &mut dyn QueueTransaction,
        task: &Task,
        rescode: Rescode,
        staging: Option<Staging>,
        remark: String,
    ) -> Result<(), DispatcherError> {
        let log_time = self.clock.true_ms();
        if rescode.is_delete() {
            tx.delete(task).await?;
        } else if rescode.is_stage() {
            match staging {
                Some(s) => {
                    debug!(
                        key = %task.key,
                        exec_time = s.exec_time,
                        stage = s.stage,
                        "task staged"
                    );
                    tx.stage(task, s.exec_time, s.stage, s.event_id).await?;
                }
                None => {
                    warn!(?task, %rescode, "stage requested without staging instructions");
                    let entry = LogEntry::for_task(
                        task,
                        Rescode::TaskCorrupt,
                        "staged without instructions",
                        log_time,
                    );
                    tx.write_log(entry).await?;
                    tx.delete(task).await?;
                }
            }
        } else {
            tx.write_log(LogEntry::for_task(task, rescode, remark, log_time)).await?;
            tx.delete(task).await?;
        }
        Ok(())
    }
}
