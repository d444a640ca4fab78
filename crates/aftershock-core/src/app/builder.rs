//! ServerBuilder - サーバーの構築とワイヤリング
//!
//! # 設計原則
//! - Builder パターンで依存を組み立てる
//! - 起動時検証（Fail-fast 設計）: config is validated and expected opcodes
//!   are checked against the handler table before anything runs

use std::sync::Arc;
use std::time::Duration;

use crate::app::dispatcher::{IdleCallback, TaskDispatcher};
use crate::app::handler::{HandlerTable, OpcodeHandler, RegistryError};
use crate::app::relay_link::RelayLink;
use crate::config::{ConfigError, ConfigHandle, ServerConfig};
use crate::domain::{Opcode, RelayMode};
use crate::impls::{ChannelRelayTransport, TaskRoleListener};
use crate::ports::{Clock, Connector, RelayTransport, RoleListener, SystemClock};

/// ServerBuilder はサーバー一台分の dispatcher と relay link を構築
///
/// # 使用例
/// ```ignore
/// let dispatcher = ServerBuilder::new(config)
///     .database(local_db)
///     .partner(partner_db)
///     .register(Opcode::GEN_TIMELINE, Arc::new(TimelineHandler))?
///     .expect_opcodes(&[Opcode::GEN_TIMELINE])
///     .build()?;
/// ```
pub struct ServerBuilder {
    config: ServerConfig,
    clock: Arc<dyn Clock>,
    database: Option<Arc<dyn Connector>>,
    partner: Option<Arc<dyn Connector>>,
    transport: Option<Box<dyn RelayTransport>>,
    listener: Arc<dyn RoleListener>,
    handlers: HandlerTable,
    idle_callbacks: Vec<Box<dyn IdleCallback>>,
    expected_opcodes: Option<Vec<Opcode>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing opcode handlers: {0:?}")]
    MissingOpcodes(Vec<Opcode>),

    #[error("no {0} connector configured")]
    MissingConnector(&'static str),

    #[error("connector serves server {got}, expected {expected}")]
    WrongServer { got: u8, expected: u8 },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            database: None,
            partner: None,
            transport: None,
            listener: Arc::new(TaskRoleListener::default()),
            handlers: HandlerTable::new(),
            idle_callbacks: Vec::new(),
            expected_opcodes: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// This server's own database.
    pub fn database(mut self, database: Arc<dyn Connector>) -> Self {
        self.database = Some(database);
        self
    }

    /// The partner server's database. Not needed in solo mode.
    pub fn partner(mut self, partner: Arc<dyn Connector>) -> Self {
        self.partner = Some(partner);
        self
    }

    /// Defaults to a `ChannelRelayTransport` sized from the config.
    pub fn transport(mut self, transport: Box<dyn RelayTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Defaults to `TaskRoleListener`.
    pub fn role_listener(mut self, listener: Arc<dyn RoleListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn register(
        mut self,
        opcode: Opcode,
        handler: Arc<dyn OpcodeHandler>,
    ) -> Result<Self, RegistryError> {
        self.handlers.register(opcode, handler)?;
        Ok(self)
    }

    pub fn override_builtin(
        mut self,
        opcode: Opcode,
        handler: Arc<dyn OpcodeHandler>,
    ) -> Result<Self, RegistryError> {
        self.handlers.override_builtin(opcode, handler)?;
        Ok(self)
    }

    pub fn idle_callback(mut self, callback: Box<dyn IdleCallback>) -> Self {
        self.idle_callbacks.push(callback);
        self
    }

    /// Opcodes that must have a handler when `build` runs.
    pub fn expect_opcodes(mut self, opcodes: &[Opcode]) -> Self {
        self.expected_opcodes = Some(opcodes.to_vec());
        self
    }

    pub fn build(self) -> Result<TaskDispatcher, BuildError> {
        self.config.validate()?;

        if let Some(expected) = &self.expected_opcodes {
            let handled = self.handlers.handled_opcodes();
            let missing: Vec<Opcode> =
                expected.iter().filter(|op| !handled.contains(op)).copied().collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingOpcodes(missing));
            }
        }

        let solo = self.config.negotiation.relay_mode == RelayMode::Solo;
        let server = &self.config.server;
        let database = self.database.ok_or(BuildError::MissingConnector("database"))?;
        if database.server_number() != server.server_number {
            return Err(BuildError::WrongServer {
                got: database.server_number(),
                expected: server.server_number,
            });
        }
        // Solo servers never call; the local database stands in for the partner.
        let partner = match self.partner {
            Some(partner) => partner,
            None if solo => Arc::clone(&database),
            None => return Err(BuildError::MissingConnector("partner")),
        };
        if !solo && partner.server_number() != server.partner_number() {
            return Err(BuildError::WrongServer {
                got: partner.server_number(),
                expected: server.partner_number(),
            });
        }

        let relay = &self.config.relay;
        let transport: Box<dyn RelayTransport> = match self.transport {
            Some(transport) => transport,
            None => Box::new(ChannelRelayTransport::new(
                relay.incoming_queue_capacity,
                Duration::from_millis(relay.transport_poll_interval),
            )),
        };

        let config = ConfigHandle::new(self.config);
        let link = RelayLink::new(
            config.clone(),
            Arc::clone(&self.clock),
            partner,
            transport,
            self.listener,
        );
        Ok(TaskDispatcher::new(
            config,
            self.clock,
            database,
            link,
            self.handlers,
            self.idle_callbacks,
        ))
    }
}
