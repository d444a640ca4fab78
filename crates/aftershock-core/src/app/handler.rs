//! Opcode handlers - Opcode ごとのタスク処理
//!
//! # 設計原則
//! - The table is built once at startup and read-only afterwards.
//! - Handlers never touch the queue directly; everything they write goes
//!   through the `DispatchContext` into the dispatcher's open transaction.
//! - An opcode nobody registered runs the fallback handler, which records
//!   the task as `UnknownOpcode`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::domain::{NewTask, Opcode, PrimaryState, RecordKey, RelayId, Rescode, Task};
use crate::ports::{Clock, QueueError, QueueTransaction};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("bad task details: {0}")]
    BadDetails(String),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for opcode {0} is already registered")]
    Duplicate(Opcode),

    #[error("opcode {0} is built in; use override_builtin to replace it")]
    Builtin(Opcode),

    #[error("opcode {0} is not built in")]
    NotBuiltin(Opcode),
}

/// How to run a `Stage*` result: when, at which stage, and optionally under
/// a new event id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Staging {
    pub exec_time: i64,
    pub stage: i32,
    pub event_id: Option<String>,
}

impl Staging {
    pub fn new(exec_time: i64, stage: i32) -> Self {
        Self {
            exec_time,
            stage,
            event_id: None,
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }
}

/// What a handler left behind for the dispatcher.
#[derive(Debug, Default)]
pub struct HandlerOutcome {
    pub staging: Option<Staging>,
    pub remark: String,
    /// Written through the relay link before the transaction commits.
    pub relay_items: Vec<(RelayId, Vec<u8>)>,
}

/// What a handler sees besides its task.
pub struct DispatchContext<'a> {
    tx: &'a mut dyn QueueTransaction,
    clock: Arc<dyn Clock>,
    primary_state: PrimaryState,
    outcome: HandlerOutcome,
}

impl<'a> DispatchContext<'a> {
    pub fn new(
        tx: &'a mut dyn QueueTransaction,
        clock: Arc<dyn Clock>,
        primary_state: PrimaryState,
    ) -> Self {
        Self {
            tx,
            clock,
            primary_state,
            outcome: HandlerOutcome::default(),
        }
    }

    pub fn effective_ms(&self) -> i64 {
        self.clock.effective_ms()
    }

    pub fn true_ms(&self) -> i64 {
        self.clock.true_ms()
    }

    pub fn primary_state(&self) -> PrimaryState {
        self.primary_state
    }

    /// Only the primary may act outside the database.
    pub fn is_primary(&self) -> bool {
        self.primary_state == PrimaryState::Primary
    }

    /// Queue a follow-up task in the same transaction.
    pub async fn post(&mut self, task: NewTask) -> Result<RecordKey, HandlerError> {
        Ok(self.tx.submit(task).await?)
    }

    pub async fn has_log(&mut self, key: RecordKey) -> Result<bool, HandlerError> {
        Ok(self.tx.has_log(key).await?)
    }

    /// Used if the handler returns a `Stage*` code.
    pub fn set_staging(&mut self, staging: Staging) {
        self.outcome.staging = Some(staging);
    }

    /// Used if the handler returns a code that is logged.
    pub fn set_remark(&mut self, remark: impl Into<String>) {
        self.outcome.remark = remark.into();
    }

    /// Replicate a record to the partner, e.g. a completion after a report
    /// went out. Dropped if the task rolls back.
    pub fn publish_relay(&mut self, relay_id: RelayId, payload: Vec<u8>) {
        self.outcome.relay_items.push((relay_id, payload));
    }

    pub fn into_outcome(self) -> HandlerOutcome {
        self.outcome
    }
}

#[async_trait]
pub trait OpcodeHandler: Send + Sync {
    async fn handle(
        &self,
        task: &Task,
        cx: &mut DispatchContext<'_>,
    ) -> Result<Rescode, HandlerError>;
}

/// Fallback for opcodes without a handler.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnknownOpcodeHandler;

#[async_trait]
impl OpcodeHandler for UnknownOpcodeHandler {
    async fn handle(
        &self,
        task: &Task,
        cx: &mut DispatchContext<'_>,
    ) -> Result<Rescode, HandlerError> {
        warn!(
            key = %task.key,
            opcode = %task.opcode,
            event_id = %task.event_id,
            "no handler for opcode"
        );
        cx.set_remark(format!("unknown opcode {}", task.opcode.0));
        Ok(Rescode::UnknownOpcode)
    }
}

/// Where the dispatcher sends a task.
pub enum Route {
    Handler(Arc<dyn OpcodeHandler>),
    /// Executed by the dispatcher itself.
    Builtin,
}

/// Opcode -> handler.
pub struct HandlerTable {
    handlers: HashMap<Opcode, Arc<dyn OpcodeHandler>>,
    fallback: Arc<dyn OpcodeHandler>,
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerTable {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Arc::new(UnknownOpcodeHandler),
        }
    }

    pub fn register(
        &mut self,
        opcode: Opcode,
        handler: Arc<dyn OpcodeHandler>,
    ) -> Result<(), RegistryError> {
        if opcode.is_builtin() {
            return Err(RegistryError::Builtin(opcode));
        }
        if self.handlers.contains_key(&opcode) {
            return Err(RegistryError::Duplicate(opcode));
        }
        self.handlers.insert(opcode, handler);
        Ok(())
    }

    /// Replace the dispatcher's own handling of a built-in opcode.
    pub fn override_builtin(
        &mut self,
        opcode: Opcode,
        handler: Arc<dyn OpcodeHandler>,
    ) -> Result<(), RegistryError> {
        if !opcode.is_builtin() {
            return Err(RegistryError::NotBuiltin(opcode));
        }
        if self.handlers.contains_key(&opcode) {
            return Err(RegistryError::Duplicate(opcode));
        }
        self.handlers.insert(opcode, handler);
        Ok(())
    }

    pub fn set_fallback(&mut self, handler: Arc<dyn OpcodeHandler>) {
        self.fallback = handler;
    }

    pub fn route(&self, opcode: Opcode) -> Route {
        match self.handlers.get(&opcode) {
            Some(handler) => Route::Handler(Arc::clone(handler)),
            None if opcode.is_builtin() => Route::Builtin,
            None => Route::Handler(Arc::clone(&self.fallback)),
        }
    }

    /// Opcodes that reach a registered handler or a built-in.
    pub fn handled_opcodes(&self) -> Vec<Opcode> {
        let mut opcodes: Vec<Opcode> =
            self.handlers.keys().copied().chain(Opcode::BUILTINS).collect();
        opcodes.sort();
        opcodes.dedup();
        opcodes
    }
}
