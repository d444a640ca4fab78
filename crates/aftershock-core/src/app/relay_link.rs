//! RelayLink - リレー接続とプライマリ交渉
//!
//! # 設計原則
//! - `poll` never waits on the transport. It reads the worker's status,
//!   drains whatever items are queued and returns.
//! - `local_status` is owned here and only changed from the task that polls.
//! - Partner data that cannot be understood disconnects the link; nothing
//!   is skipped silently.
//!
//! Connection lifecycle:
//! `Shutdown -> (Solo | Disconnected) -> Calling -> InitialSync -> Connected <-> Resync`,
//! with every state past `Disconnected` falling back to it on failure.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::app::negotiation::{LinkView, Liveness, NegotiationInput, negotiate};
use crate::app::resync::ResyncCycle;
use crate::app::status::LinkStatusView;
use crate::config::{ConfigHandle, ServerConfig, as_ms};
use crate::domain::{
    InferredState, LinkState, PrimaryState, RelayConfig, RelayId, RelayIdError, RelayItem,
    RelayItemKind, RelayMode, ServerStatus, StatusFormatError,
};
use crate::ports::{
    CallFailure, Clock, Connector, DbHandle, FetchSink, FetchStatus, RelayAuditEntry, RelayStore,
    RelayStoreError, RelayTransport, RoleListener, TransportStatus,
};
use crate::queue::CallRetryPolicy;

/// Upper bound of every fetch window.
const FAR_FUTURE: i64 = i64::MAX;

/// Why a relay item could not be merged.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error(transparent)]
    BadRelayId(#[from] RelayIdError),

    #[error(transparent)]
    BadStatus(#[from] StatusFormatError),

    #[error("status of server {got} received where server {expected} was expected")]
    UnexpectedServer { got: u8, expected: u8 },

    #[error("relay id {0} is reserved for server status")]
    ReservedKind(RelayId),

    #[error(transparent)]
    Store(#[from] RelayStoreError),
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

pub struct RelayLink {
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
    partner: Arc<dyn Connector>,
    transport: Box<dyn RelayTransport>,
    listener: Arc<dyn RoleListener>,

    local_status: ServerStatus,
    remote_status: Option<ServerStatus>,
    remote_status_item: Option<RelayItem>,

    /// Failed attempts of the current reconnection run; 0 once connected.
    call_attempts: u32,
    next_call_time: i64,
    resync: ResyncCycle,
    next_resync_time: Option<i64>,
    sink: Arc<FetchSink>,
    /// Items merged from the running fetch so far.
    fetched: usize,
    /// The running fetch is abandoned if nothing arrives before this.
    fetch_deadline: Option<i64>,
    init_deadline: i64,

    /// `local_status` changed since it was last written.
    dirty: bool,
    last_relay_time: i64,
    stamp_counter: u64,
}

impl RelayLink {
    pub fn new(
        config: ConfigHandle,
        clock: Arc<dyn Clock>,
        partner: Arc<dyn Connector>,
        transport: Box<dyn RelayTransport>,
        listener: Arc<dyn RoleListener>,
    ) -> Self {
        let cfg = config.current();
        let now = clock.true_ms();
        let relay_config = RelayConfig::new(
            0,
            cfg.negotiation.relay_mode,
            cfg.negotiation.configured_primary,
        );
        Self {
            local_status: ServerStatus::new(cfg.server.server_number, relay_config, now),
            config,
            clock,
            partner,
            transport,
            listener,
            remote_status: None,
            remote_status_item: None,
            call_attempts: 0,
            next_call_time: now,
            resync: ResyncCycle::default(),
            next_resync_time: None,
            sink: Arc::new(FetchSink::bounded(cfg.relay.incoming_queue_capacity)),
            fetched: 0,
            fetch_deadline: None,
            init_deadline: now,
            dirty: false,
            last_relay_time: 0,
            stamp_counter: 0,
        }
    }

    pub fn server_number(&self) -> u8 {
        self.local_status.server_number
    }

    pub fn link_state(&self) -> LinkState {
        self.local_status.link_state
    }

    pub fn primary_state(&self) -> PrimaryState {
        self.local_status.primary_state
    }

    pub fn is_primary(&self) -> bool {
        self.local_status.primary_state == PrimaryState::Primary
    }

    pub fn local_status(&self) -> &ServerStatus {
        &self.local_status
    }

    pub fn remote_status(&self) -> Option<&ServerStatus> {
        self.remote_status.as_ref()
    }

    pub fn status_snapshot(&self) -> LinkStatusView {
        let link_state = self.local_status.link_state;
        LinkStatusView {
            local: self.local_status.clone(),
            remote: self.remote_status.clone(),
            call_attempts: self.call_attempts,
            resync_counter: self.resync.counter(),
            next_call_time: (link_state == LinkState::Disconnected).then_some(self.next_call_time),
            next_resync_time: self.next_resync_time,
            init_deadline: self.init_deadline,
        }
    }

    /// Start (or restart) the link: adopt a newer persisted relay config,
    /// enter `Solo` or `Disconnected`, and place the first call right away.
    pub async fn init(&mut self, db: &DbHandle) -> Result<(), RelayStoreError> {
        let cfg = self.config.current();
        let now = self.clock.true_ms();
        let server_number = cfg.server.server_number;

        let mut relay_config = RelayConfig::new(
            0,
            cfg.negotiation.relay_mode,
            cfg.negotiation.configured_primary,
        );
        if let Some(item) = db.relay.get_status(server_number).await? {
            match ServerStatus::from_item(&item) {
                Ok(previous) => {
                    if previous.relay_config.supersedes(&relay_config) {
                        info!(
                            server_number,
                            mode_timestamp = previous.relay_config.mode_timestamp,
                            relay_mode = %previous.relay_config.relay_mode,
                            "resuming persisted relay config"
                        );
                        relay_config = previous.relay_config;
                    }
                    self.last_relay_time = self.last_relay_time.max(item.relay_time);
                }
                Err(e) => warn!(server_number, error = %e, "ignoring unreadable persisted status"),
            }
        }

        self.transport.shutdown();
        self.local_status = ServerStatus::new(server_number, relay_config, now);
        self.remote_status = None;
        self.remote_status_item = None;
        self.next_resync_time = None;
        self.sink.clear();
        self.fetch_deadline = None;
        self.init_deadline = now.saturating_add(as_ms(cfg.negotiation.prist_init_timeout));
        self.enter_topology(now);
        self.dirty = true;
        info!(
            server_number,
            relay_mode = %self.local_status.relay_config.relay_mode,
            configured_primary = self.local_status.relay_config.configured_primary,
            "relay link initialized"
        );

        self.poll(db).await
    }

    /// One non-blocking step of the link.
    pub async fn poll(&mut self, db: &DbHandle) -> Result<(), RelayStoreError> {
        if self.local_status.link_state == LinkState::Shutdown {
            return Ok(());
        }
        let cfg = self.config.current();
        let now = self.clock.true_ms();

        match self.local_status.link_state {
            LinkState::Shutdown | LinkState::Solo => {}
            LinkState::Disconnected => self.poll_disconnected(&cfg, now),
            LinkState::Calling => self.poll_calling(&cfg, now),
            LinkState::InitialSync | LinkState::Resync => self.poll_syncing(db, &cfg, now).await?,
            LinkState::Connected => self.poll_connected(db, &cfg, now).await?,
        }

        self.adopt_remote_config(&cfg, now);
        self.renegotiate(db, &cfg, now).await;

        if now - self.local_status.heartbeat_time > as_ms(cfg.relay.heartbeat_interval) {
            self.local_status.heartbeat_time = now;
            self.dirty = true;
        }
        if self.dirty {
            self.write_status(db, now).await?;
        }
        Ok(())
    }

    /// Poll until a role is determined or `timeout` (true time) passes.
    pub async fn wait_for_role(
        &mut self,
        db: &DbHandle,
        timeout: Duration,
    ) -> Result<PrimaryState, RelayStoreError> {
        let start = self.clock.true_ms();
        loop {
            let state = self.local_status.primary_state;
            if state.is_resolved() || state == PrimaryState::Shutdown {
                return Ok(state);
            }
            if self.clock.true_ms() - start >= duration_ms(timeout) {
                warn!(
                    server_number = self.server_number(),
                    link_state = %self.local_status.link_state,
                    "role not determined within the startup wait"
                );
                return Ok(state);
            }
            let step = self.config.current().relay.transport_poll_interval;
            tokio::time::sleep(Duration::from_millis(step)).await;
            self.poll(db).await?;
        }
    }

    /// Administrative change of relay mode and roles. The new config gets a
    /// `mode_timestamp` past both servers' current ones, so it wins
    /// everywhere; the link restarts.
    pub async fn set_relay_config(
        &mut self,
        db: &DbHandle,
        relay_mode: RelayMode,
        configured_primary: u8,
    ) -> Result<RelayConfig, RelayStoreError> {
        let cfg = self.config.current();
        let now = self.clock.true_ms();
        let remote_ts = self
            .remote_status
            .as_ref()
            .map_or(0, |r| r.relay_config.mode_timestamp);
        let mode_timestamp = self.local_status.relay_config.mode_timestamp.max(remote_ts) + 1;
        let relay_config = RelayConfig::new(mode_timestamp, relay_mode, configured_primary);

        info!(
            server_number = self.server_number(),
            mode_timestamp,
            %relay_mode,
            configured_primary,
            "relay config set"
        );
        self.apply_relay_config(relay_config.clone(), &cfg, now, true);
        self.poll(db).await?;
        Ok(relay_config)
    }

    pub fn set_health(&mut self, health_status: u32) {
        if self.local_status.health_status != health_status {
            info!(
                server_number = self.server_number(),
                from = self.local_status.health_status,
                to = health_status,
                "health status changed"
            );
            self.local_status.health_status = health_status;
            self.dirty = true;
        }
    }

    /// Write a locally produced item into this server's relay log, from where
    /// the partner picks it up.
    pub async fn submit_relay_item(
        &mut self,
        db: &DbHandle,
        relay_id: RelayId,
        payload: Vec<u8>,
    ) -> Result<RelayItem, MergeError> {
        let kind = relay_id.kind()?;
        if kind == RelayItemKind::ServerStatus {
            return Err(MergeError::ReservedKind(relay_id));
        }
        let relay_time = self.next_relay_time(self.clock.true_ms());
        let stamp = self.next_stamp();
        let item = RelayItem::new(relay_id, relay_time, stamp, payload);
        let action = match kind {
            RelayItemKind::AnalystSelection => db.relay.insert_if_newer(&item).await?,
            _ => db.relay.insert_if_absent(&item).await?,
        };
        debug!(relay_id = %item.relay_id, relay_time, ?action, "relay item submitted");
        Ok(item)
    }

    /// Final status write, then hard stop of the transport.
    pub async fn shutdown(&mut self, db: &DbHandle) -> Result<(), RelayStoreError> {
        info!(server_number = self.server_number(), "relay link shutting down");
        self.set_primary_state(PrimaryState::Shutdown);
        self.set_link_state(LinkState::Shutdown);
        let result = self.write_status(db, self.clock.true_ms()).await;
        self.transport.terminate();
        result
    }

    fn enter_topology(&mut self, now: i64) {
        self.call_attempts = 0;
        self.next_call_time = now;
        if self.local_status.relay_config.relay_mode == RelayMode::Solo {
            self.set_inferred(InferredState::Solo);
            self.set_link_state(LinkState::Solo);
        } else {
            self.set_inferred(InferredState::Unknown);
            self.set_link_state(LinkState::Disconnected);
        }
    }

    fn poll_disconnected(&mut self, cfg: &ServerConfig, now: i64) {
        if now < self.next_call_time {
            return;
        }
        self.call_attempts += 1;
        debug!(
            server_number = self.server_number(),
            attempt = self.call_attempts,
            "calling partner"
        );
        if self.transport.start(Arc::clone(&self.partner), true) {
            self.set_link_state(LinkState::Calling);
        } else {
            self.call_failed(cfg, now, CallFailure::NotCallable);
        }
    }

    fn poll_calling(&mut self, cfg: &ServerConfig, now: i64) {
        match self.transport.status() {
            TransportStatus::Idle | TransportStatus::Starting => {}
            TransportStatus::Failed(reason) => self.call_failed(cfg, now, reason),
            TransportStatus::Stopped => self.call_failed(cfg, now, CallFailure::Unreachable),
            TransportStatus::Running => {
                let Some(first) = self.transport.dequeue_item() else {
                    return;
                };
                match self.accept_partner_status(&first) {
                    Ok(status) => self.call_succeeded(cfg, now, status, first),
                    Err(reason) => self.call_failed(cfg, now, reason),
                }
            }
        }
    }

    fn accept_partner_status(&self, item: &RelayItem) -> Result<ServerStatus, CallFailure> {
        let status = ServerStatus::from_item(item).map_err(|e| {
            warn!(
                server_number = self.server_number(),
                error = %e,
                "partner opened with an unreadable status"
            );
            CallFailure::BadSyncData
        })?;
        if status.server_number != self.partner.server_number()
            || !status.is_connectable_from(&self.local_status)
        {
            warn!(
                server_number = self.server_number(),
                partner = status.server_number,
                partner_link_state = %status.link_state,
                partner_protocol = status.protocol_version,
                "partner status is not connectable"
            );
            return Err(CallFailure::BadState);
        }
        Ok(status)
    }

    fn call_succeeded(
        &mut self,
        cfg: &ServerConfig,
        now: i64,
        status: ServerStatus,
        item: RelayItem,
    ) {
        info!(
            server_number = self.server_number(),
            attempts = self.call_attempts,
            "partner answered, starting initial sync"
        );
        self.call_attempts = 0;
        self.remote_status = Some(status);
        self.remote_status_item = Some(item);
        self.resync.prime(&cfg.resync);

        let lo = now.saturating_sub(as_ms(cfg.resync.lookback_long));
        if !self.start_fetch(cfg, now, lo) {
            self.disconnect(now, CallFailure::Unreachable, "initial fetch refused");
            return;
        }
        self.set_inferred(InferredState::Syncing);
        self.set_link_state(LinkState::InitialSync);
    }

    fn call_failed(&mut self, cfg: &ServerConfig, now: i64, reason: CallFailure) {
        self.transport.shutdown();
        let policy = CallRetryPolicy::from_config(&cfg.relay);
        let inferred = if self.call_attempts <= cfg.relay.listening_attempt_limit {
            InferredState::Listening
        } else {
            reason.dead_state()
        };
        let delay = duration_ms(policy.delay_before(self.call_attempts + 1));
        self.next_call_time = now.saturating_add(delay);
        warn!(
            server_number = self.server_number(),
            attempt = self.call_attempts,
            ?reason,
            %inferred,
            retry_in_ms = delay,
            lost = policy.is_lost(self.call_attempts),
            "relay call failed"
        );
        self.set_inferred(inferred);
        self.set_link_state(LinkState::Disconnected);
    }

    async fn poll_syncing(
        &mut self,
        db: &DbHandle,
        cfg: &ServerConfig,
        now: i64,
    ) -> Result<(), RelayStoreError> {
        if !self.drain(db, cfg, now).await? {
            return Ok(());
        }
        if let Some(reason) = self.transport_failure() {
            self.disconnect(now, reason, "transport stopped during sync");
            return Ok(());
        }
        let chunk = self.sink.take_up_to(cfg.relay.incoming_queue_capacity);
        if !chunk.is_empty() {
            self.fetch_deadline = Some(now.saturating_add(as_ms(cfg.relay.fetch_timeout)));
            if !self.merge_fetched(db, chunk, now).await? {
                return Ok(());
            }
        }
        match self.transport.fetch_status() {
            FetchStatus::Idle | FetchStatus::Active => {
                if self.fetch_deadline.is_some_and(|deadline| now >= deadline) {
                    self.disconnect(now, CallFailure::Unreachable, "fetch timed out");
                }
                Ok(())
            }
            FetchStatus::Failed => {
                self.disconnect(now, CallFailure::Unreachable, "fetch failed");
                Ok(())
            }
            FetchStatus::Finished => self.finish_sync(db, cfg, now).await,
        }
    }

    async fn finish_sync(
        &mut self,
        db: &DbHandle,
        cfg: &ServerConfig,
        now: i64,
    ) -> Result<(), RelayStoreError> {
        let rest = self.sink.take();
        if !self.merge_fetched(db, rest, now).await? {
            return Ok(());
        }
        let fetched = self.fetched;
        self.fetch_deadline = None;

        let connectable = self
            .remote_status
            .as_ref()
            .is_some_and(|r| r.is_connectable_from(&self.local_status));
        if !connectable {
            self.disconnect(now, CallFailure::BadState, "partner no longer connectable after sync");
            return Ok(());
        }

        if self.local_status.link_state == LinkState::Resync {
            self.resync.advance(&cfg.resync);
        }
        let plan = self.resync.plan(&cfg.resync);
        self.next_resync_time = Some(now.saturating_add(plan.interval));
        info!(
            server_number = self.server_number(),
            fetched,
            resync_counter = self.resync.counter(),
            next_resync_in_ms = plan.interval,
            "relay sync finished"
        );
        self.set_inferred(InferredState::Connected);
        self.set_link_state(LinkState::Connected);
        Ok(())
    }

    async fn poll_connected(
        &mut self,
        db: &DbHandle,
        cfg: &ServerConfig,
        now: i64,
    ) -> Result<(), RelayStoreError> {
        if !self.drain(db, cfg, now).await? {
            return Ok(());
        }
        if let Some(reason) = self.transport_failure() {
            self.disconnect(now, reason, "transport stopped");
            return Ok(());
        }
        if self.next_resync_time.is_none_or(|t| now < t) {
            return Ok(());
        }

        let plan = self.resync.plan(&cfg.resync);
        let lo = now.saturating_sub(plan.lookback);
        if self.start_fetch(cfg, now, lo) {
            info!(
                server_number = self.server_number(),
                resync_counter = self.resync.counter(),
                lookback_ms = plan.lookback,
                deep = plan.is_deep(&cfg.resync),
                "relay resync started"
            );
            self.next_resync_time = None;
            self.set_link_state(LinkState::Resync);
        } else {
            self.disconnect(now, CallFailure::Unreachable, "resync fetch refused");
        }
        Ok(())
    }

    fn start_fetch(&mut self, cfg: &ServerConfig, now: i64, lo: i64) -> bool {
        self.sink.clear();
        self.fetched = 0;
        self.fetch_deadline = Some(now.saturating_add(as_ms(cfg.relay.fetch_timeout)));
        self.transport.request_fetch(Arc::clone(&self.sink), lo, FAR_FUTURE)
    }

    async fn merge_fetched(
        &mut self,
        db: &DbHandle,
        mut items: Vec<RelayItem>,
        now: i64,
    ) -> Result<bool, RelayStoreError> {
        items.sort();
        self.fetched += items.len();
        self.merge_batch(db, items, now).await
    }

    fn transport_failure(&self) -> Option<CallFailure> {
        match self.transport.status() {
            TransportStatus::Running => None,
            TransportStatus::Failed(reason) => Some(reason),
            TransportStatus::Idle | TransportStatus::Starting | TransportStatus::Stopped => {
                Some(CallFailure::Unreachable)
            }
        }
    }

    fn disconnect(&mut self, now: i64, reason: CallFailure, what: &str) {
        warn!(
            server_number = self.server_number(),
            ?reason,
            link_state = %self.local_status.link_state,
            "{what}, disconnecting"
        );
        self.transport.shutdown();
        self.sink.clear();
        self.fetch_deadline = None;
        self.next_resync_time = None;
        self.call_attempts = 0;
        self.next_call_time = now;
        self.set_inferred(reason.dead_state());
        self.set_link_state(LinkState::Disconnected);
    }

    /// Merge up to one queue's worth of incoming items. `Ok(false)` means the
    /// link disconnected.
    async fn drain(
        &mut self,
        db: &DbHandle,
        cfg: &ServerConfig,
        now: i64,
    ) -> Result<bool, RelayStoreError> {
        let mut items = Vec::new();
        while items.len() < cfg.relay.incoming_queue_capacity {
            match self.transport.dequeue_item() {
                Some(item) => items.push(item),
                None => break,
            }
        }
        self.merge_batch(db, items, now).await
    }

    async fn merge_batch(
        &mut self,
        db: &DbHandle,
        items: Vec<RelayItem>,
        now: i64,
    ) -> Result<bool, RelayStoreError> {
        for item in items {
            match self.merge_item(db, item, now).await {
                Ok(()) => {}
                Err(MergeError::Store(e)) => return Err(e),
                Err(e) => {
                    warn!(server_number = self.server_number(), error = %e, "untrusted relay data");
                    self.disconnect(now, CallFailure::BadSyncData, "bad relay item");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    async fn merge_item(
        &mut self,
        db: &DbHandle,
        item: RelayItem,
        now: i64,
    ) -> Result<(), MergeError> {
        let action = match item.kind()? {
            RelayItemKind::ServerStatus => return self.merge_remote_status(item),
            RelayItemKind::Completion | RelayItemKind::Removal => {
                db.relay.insert_if_absent(&item).await?
            }
            RelayItemKind::AnalystSelection => db.relay.insert_if_newer(&item).await?,
        };
        debug!(
            relay_id = %item.relay_id,
            relay_time = item.relay_time,
            ?action,
            "merged remote relay item"
        );
        db.relay
            .audit(RelayAuditEntry {
                relay_id: item.relay_id,
                relay_time: item.relay_time,
                action,
                log_time: now,
            })
            .await?;
        Ok(())
    }

    /// Partner status lives only in memory and is replaced only by a
    /// strictly newer item.
    fn merge_remote_status(&mut self, item: RelayItem) -> Result<(), MergeError> {
        let status = ServerStatus::from_item(&item)?;
        let expected = self.partner.server_number();
        if status.server_number != expected {
            return Err(MergeError::UnexpectedServer {
                got: status.server_number,
                expected,
            });
        }
        if self
            .remote_status_item
            .as_ref()
            .is_none_or(|current| item.is_newer_than(current))
        {
            self.remote_status = Some(status);
            self.remote_status_item = Some(item);
        }
        Ok(())
    }

    fn adopt_remote_config(&mut self, cfg: &ServerConfig, now: i64) {
        let Some(remote) = &self.remote_status else {
            return;
        };
        if !remote.relay_config.supersedes(&self.local_status.relay_config) {
            return;
        }
        let adopted = remote.relay_config.clone();
        info!(
            server_number = self.server_number(),
            mode_timestamp = adopted.mode_timestamp,
            relay_mode = %adopted.relay_mode,
            configured_primary = adopted.configured_primary,
            "adopting newer relay config from partner"
        );
        self.apply_relay_config(adopted, cfg, now, false);
    }

    fn apply_relay_config(
        &mut self,
        relay_config: RelayConfig,
        cfg: &ServerConfig,
        now: i64,
        restart: bool,
    ) {
        let previous = std::mem::replace(&mut self.local_status.relay_config, relay_config);
        self.dirty = true;
        let current = &self.local_status.relay_config;

        let roles_changed = !previous.same_roles(current);
        let topology_changed = previous.relay_mode != current.relay_mode;

        if roles_changed && self.local_status.primary_state != PrimaryState::Shutdown {
            self.set_primary_state(PrimaryState::Initializing);
            self.init_deadline = now.saturating_add(as_ms(cfg.negotiation.prist_init_timeout));
        }
        if restart || topology_changed {
            self.transport.shutdown();
            self.sink.clear();
            self.fetch_deadline = None;
            self.next_resync_time = None;
            self.remote_status = None;
            self.remote_status_item = None;
            self.enter_topology(now);
        }
    }

    async fn renegotiate(&mut self, db: &DbHandle, cfg: &ServerConfig, now: i64) {
        let policy = CallRetryPolicy::from_config(&cfg.relay);
        let link_state = self.local_status.link_state;
        let relay_config = &self.local_status.relay_config;

        let liveness = Liveness::assess(&LinkView {
            link_state,
            connection_lost: policy.is_lost(self.call_attempts),
            local_config: relay_config,
            remote: self.remote_status.as_ref(),
            now,
            heartbeat_stale: as_ms(cfg.relay.heartbeat_stale),
        });
        let next = negotiate(&NegotiationInput {
            current: self.local_status.primary_state,
            relay_mode: relay_config.relay_mode,
            server_number: self.local_status.server_number,
            configured_primary: relay_config.configured_primary,
            liveness,
            init_timed_out: now >= self.init_deadline,
            link_definite: link_state.is_definite(),
        });

        if next == self.local_status.primary_state {
            return;
        }
        debug!(?liveness, "negotiation inputs");
        self.set_primary_state(next);
        match next {
            PrimaryState::Primary => self.listener.on_primary(db).await,
            PrimaryState::Secondary => self.listener.on_secondary(db).await,
            PrimaryState::Initializing | PrimaryState::Shutdown => {}
        }
    }

    fn set_link_state(&mut self, state: LinkState) {
        let previous = self.local_status.link_state;
        if previous != state {
            info!(
                server_number = self.server_number(),
                from = %previous,
                to = %state,
                "link state changed"
            );
            self.local_status.link_state = state;
            self.dirty = true;
        }
    }

    fn set_primary_state(&mut self, state: PrimaryState) {
        let previous = self.local_status.primary_state;
        if previous != state {
            info!(
                server_number = self.server_number(),
                from = %previous,
                to = %state,
                "primary state changed"
            );
            self.local_status.primary_state = state;
            self.dirty = true;
        }
    }

    fn set_inferred(&mut self, state: InferredState) {
        let previous = self.local_status.inferred_state;
        if previous != state {
            debug!(
                server_number = self.server_number(),
                from = %previous,
                to = %state,
                "inferred partner state changed"
            );
            self.local_status.inferred_state = state;
            self.dirty = true;
        }
    }

    /// Relay times written by this server strictly increase.
    fn next_relay_time(&mut self, now: i64) -> i64 {
        let time = now.max(self.last_relay_time + 1);
        self.last_relay_time = time;
        time
    }

    fn next_stamp(&mut self) -> String {
        self.stamp_counter += 1;
        format!("{}-{}", self.server_number(), self.stamp_counter)
    }

    async fn write_status(&mut self, db: &DbHandle, now: i64) -> Result<(), RelayStoreError> {
        let relay_time = self.next_relay_time(now);
        let stamp = self.next_stamp();
        let item = self.local_status.to_item(relay_time, stamp);
        db.relay.put_status(&item).await?;
        self.dirty = false;
        debug!(
            server_number = self.server_number(),
            relay_time,
            link_state = %self.local_status.link_state,
            primary_state = %self.local_status.primary_state,
            "status written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Mutex, MutexGuard};

    use async_trait::async_trait;

    use crate::domain::health;
    use crate::impls::InMemoryDatabase;
    use crate::ports::FixedClock;

    const T0: i64 = 1_700_000_000_000;

    struct Script {
        start_ok: bool,
        on_start: TransportStatus,
        status: TransportStatus,
        fetch: FetchStatus,
        queue: VecDeque<RelayItem>,
        sink: Option<Arc<FetchSink>>,
        fetches: Vec<(i64, i64)>,
        starts: u32,
        shutdowns: u32,
        terminated: bool,
    }

    impl Default for Script {
        fn default() -> Self {
            Self {
                start_ok: true,
                on_start: TransportStatus::Running,
                status: TransportStatus::Idle,
                fetch: FetchStatus::Idle,
                queue: VecDeque::new(),
                sink: None,
                fetches: Vec::new(),
                starts: 0,
                shutdowns: 0,
                terminated: false,
            }
        }
    }

    /// Transport whose behaviour the test scripts step by step.
    struct ScriptedTransport(Arc<Mutex<Script>>);

    impl ScriptedTransport {
        fn script(&self) -> MutexGuard<'_, Script> {
            self.0.lock().unwrap()
        }
    }

    impl RelayTransport for ScriptedTransport {
        fn start(&mut self, _partner: Arc<dyn Connector>, _with_status_read: bool) -> bool {
            let mut s = self.script();
            s.starts += 1;
            if s.start_ok {
                s.status = s.on_start;
                s.fetch = FetchStatus::Idle;
            }
            s.start_ok
        }

        fn status(&self) -> TransportStatus {
            self.script().status
        }

        fn request_fetch(&mut self, sink: Arc<FetchSink>, lo: i64, hi: i64) -> bool {
            let mut s = self.script();
            s.fetches.push((lo, hi));
            s.sink = Some(sink);
            s.fetch = FetchStatus::Active;
            true
        }

        fn fetch_status(&self) -> FetchStatus {
            self.script().fetch
        }

        fn dequeue_item(&mut self) -> Option<RelayItem> {
            self.script().queue.pop_front()
        }

        fn shutdown(&mut self) {
            let mut s = self.script();
            s.shutdowns += 1;
            s.status = TransportStatus::Stopped;
        }

        fn terminate(&mut self) {
            let mut s = self.script();
            s.terminated = true;
            s.status = TransportStatus::Stopped;
        }
    }

    #[derive(Default)]
    struct RecordingListener {
        calls: Mutex<Vec<PrimaryState>>,
    }

    #[async_trait]
    impl RoleListener for RecordingListener {
        async fn on_primary(&self, _db: &DbHandle) {
            self.calls.lock().unwrap().push(PrimaryState::Primary);
        }

        async fn on_secondary(&self, _db: &DbHandle) {
            self.calls.lock().unwrap().push(PrimaryState::Secondary);
        }
    }

    struct Harness {
        link: RelayLink,
        script: Arc<Mutex<Script>>,
        clock: Arc<FixedClock>,
        local: Arc<InMemoryDatabase>,
        db: DbHandle,
        listener: Arc<RecordingListener>,
        server: u8,
    }

    impl Harness {
        fn new(server: u8, relay_mode: RelayMode, tweak: impl FnOnce(&mut ServerConfig)) -> Self {
            let mut cfg = ServerConfig::for_server(server);
            cfg.negotiation.relay_mode = relay_mode;
            tweak(&mut cfg);

            let clock = Arc::new(FixedClock::from_millis(T0));
            let local = Arc::new(InMemoryDatabase::new(server, clock.clone()));
            let partner = Arc::new(InMemoryDatabase::new(3 - server, clock.clone()));
            let script = Arc::new(Mutex::new(Script::default()));
            let listener = Arc::new(RecordingListener::default());
            let link = RelayLink::new(
                ConfigHandle::new(cfg),
                clock.clone(),
                partner,
                Box::new(ScriptedTransport(script.clone())),
                listener.clone(),
            );
            let db = local.handle();
            Self {
                link,
                script,
                clock,
                local,
                db,
                listener,
                server,
            }
        }

        fn script(&self) -> MutexGuard<'_, Script> {
            self.script.lock().unwrap()
        }

        fn now(&self) -> i64 {
            self.clock.true_ms()
        }

        fn partner_item(
            &self,
            relay_time: i64,
            heartbeat_time: i64,
            relay_config: RelayConfig,
        ) -> RelayItem {
            let partner = 3 - self.server;
            let mut s = ServerStatus::new(partner, relay_config, T0);
            s.link_state = LinkState::Connected;
            s.heartbeat_time = heartbeat_time;
            s.to_item(relay_time, format!("{partner}-{relay_time}"))
        }

        fn default_config(&self) -> RelayConfig {
            RelayConfig::new(0, RelayMode::Pair, 1)
        }

        fn push(&self, item: RelayItem) {
            self.script().queue.push_back(item);
        }

        fn finish_fetch(&self, items: Vec<RelayItem>) {
            let mut s = self.script();
            if let Some(sink) = &s.sink {
                sink.extend(items);
            }
            s.fetch = FetchStatus::Finished;
        }

        async fn poll(&mut self) {
            self.link.poll(&self.db).await.unwrap();
        }

        /// init -> Calling -> InitialSync -> Connected.
        async fn connect(&mut self, partner_status: RelayItem) {
            self.push(partner_status);
            self.link.init(&self.db).await.unwrap();
            assert_eq!(self.link.link_state(), LinkState::Calling);
            self.poll().await;
            assert_eq!(self.link.link_state(), LinkState::InitialSync);
            self.finish_fetch(vec![]);
            self.poll().await;
            assert_eq!(self.link.link_state(), LinkState::Connected);
        }

        fn roles(&self) -> Vec<PrimaryState> {
            self.listener.calls.lock().unwrap().clone()
        }

        async fn persisted(&self) -> ServerStatus {
            let item = self.db.relay.get_status(self.server).await.unwrap().unwrap();
            ServerStatus::from_item(&item).unwrap()
        }
    }

    fn done(key: &str, time: i64) -> RelayItem {
        RelayItem::new(RelayId::new(RelayItemKind::Completion, key), time, "2-9", b"{}".to_vec())
    }

    #[tokio::test]
    async fn solo_mode_resolves_role_without_calling() {
        let mut h = Harness::new(1, RelayMode::Solo, |_| {});
        h.link.init(&h.db).await.unwrap();
        assert_eq!(h.link.link_state(), LinkState::Solo);
        assert_eq!(h.link.primary_state(), PrimaryState::Primary);
        assert_eq!(h.roles(), [PrimaryState::Primary]);
        assert_eq!(h.script().starts, 0);
        assert_eq!(h.persisted().await.primary_state, PrimaryState::Primary);

        let mut h2 = Harness::new(2, RelayMode::Solo, |_| {});
        h2.link.init(&h2.db).await.unwrap();
        assert_eq!(h2.link.primary_state(), PrimaryState::Secondary);
        let role = h2.link.wait_for_role(&h2.db, Duration::from_secs(1)).await.unwrap();
        assert_eq!(role, PrimaryState::Secondary);
    }

    #[tokio::test]
    async fn connect_runs_initial_sync_with_long_lookback() {
        let mut h = Harness::new(1, RelayMode::Pair, |_| {});
        let status = h.partner_item(T0, T0, h.default_config());
        h.push(status);

        h.link.init(&h.db).await.unwrap();
        assert_eq!(h.link.link_state(), LinkState::Calling);
        assert_eq!(h.link.status_snapshot().call_attempts, 1);

        h.poll().await;
        assert_eq!(h.link.link_state(), LinkState::InitialSync);
        assert_eq!(h.link.local_status().inferred_state, InferredState::Syncing);
        assert_eq!(h.script().fetches, [(T0 - 2_592_000_000, i64::MAX)]);
        assert_eq!(h.link.status_snapshot().call_attempts, 0);
        assert_eq!(h.link.status_snapshot().resync_counter, -2);

        // still fetching: stays in initial sync
        h.poll().await;
        assert_eq!(h.link.link_state(), LinkState::InitialSync);

        h.finish_fetch(vec![done("ev1", T0 - 5_000)]);
        h.poll().await;
        assert_eq!(h.link.link_state(), LinkState::Connected);
        assert_eq!(h.link.local_status().inferred_state, InferredState::Connected);
        assert_eq!(h.link.status_snapshot().next_resync_time, Some(T0 + 60_000));
        assert_eq!(h.local.relay.items().len(), 1);
        assert_eq!(h.local.relay.audit_entries().len(), 1);

        // same config, fresh heartbeat: the configured primary takes over
        assert_eq!(h.link.primary_state(), PrimaryState::Primary);
        assert_eq!(h.persisted().await.link_state, LinkState::Connected);
    }

    #[tokio::test]
    async fn call_failures_back_off_and_classify() {
        let mut h = Harness::new(1, RelayMode::Pair, |_| {});
        h.script().on_start = TransportStatus::Failed(CallFailure::Unreachable);

        h.link.init(&h.db).await.unwrap();
        assert_eq!(h.link.link_state(), LinkState::Calling);

        // (attempt, wait before the next one, inferred state after the failure)
        let expected = [
            (1, 30_000, InferredState::Listening),
            (2, 30_000, InferredState::Listening),
            (3, 30_000, InferredState::DeadUnreachable),
            (4, 300_000, InferredState::DeadUnreachable),
        ];
        for (attempt, wait, inferred) in expected {
            h.poll().await;
            assert_eq!(h.link.link_state(), LinkState::Disconnected);
            let snap = h.link.status_snapshot();
            assert_eq!(snap.call_attempts, attempt);
            assert_eq!(snap.next_call_time, Some(h.now() + wait));
            assert_eq!(snap.local.inferred_state, inferred);

            h.clock.advance_ms(wait - 1);
            h.poll().await;
            assert_eq!(h.script().starts, attempt, "called too early");
            h.clock.advance_ms(1);
            h.poll().await;
            assert_eq!(h.link.link_state(), LinkState::Calling);
        }
    }

    #[tokio::test]
    async fn secondary_promotes_only_once_partner_is_lost() {
        let mut h = Harness::new(2, RelayMode::Pair, |_| {});
        let status = h.partner_item(T0, T0, h.default_config());
        h.connect(status).await;
        assert_eq!(h.link.primary_state(), PrimaryState::Secondary);

        {
            let mut s = h.script();
            s.status = TransportStatus::Failed(CallFailure::Unreachable);
            s.on_start = TransportStatus::Failed(CallFailure::Unreachable);
        }
        h.poll().await;
        assert_eq!(h.link.link_state(), LinkState::Disconnected);
        assert_eq!(h.link.status_snapshot().call_attempts, 0);

        // call_retry_loss_conn = 4: lost once a sixth call has failed
        for attempt in 1..=6 {
            let due = h.link.status_snapshot().next_call_time.unwrap();
            h.clock.advance_ms(due - h.now());
            h.poll().await;
            assert_eq!(h.link.link_state(), LinkState::Calling);
            assert_eq!(h.link.primary_state(), PrimaryState::Secondary);
            h.poll().await;
            assert_eq!(h.link.link_state(), LinkState::Disconnected);
            assert_eq!(h.link.status_snapshot().call_attempts, attempt);
            let expected = if attempt < 6 {
                PrimaryState::Secondary
            } else {
                PrimaryState::Primary
            };
            assert_eq!(h.link.primary_state(), expected, "after failed call {attempt}");
        }
        assert_eq!(h.roles(), [PrimaryState::Secondary, PrimaryState::Primary]);
    }

    #[tokio::test]
    async fn stalled_fetch_disconnects_as_unreachable() {
        let mut h = Harness::new(1, RelayMode::Pair, |cfg| cfg.relay.fetch_timeout = 60_000);
        let status = h.partner_item(T0, T0, h.default_config());
        h.push(status);
        h.link.init(&h.db).await.unwrap();
        h.poll().await;
        assert_eq!(h.link.link_state(), LinkState::InitialSync);

        h.clock.advance_ms(59_999);
        h.poll().await;
        assert_eq!(h.link.link_state(), LinkState::InitialSync);

        h.clock.advance_ms(1);
        h.poll().await;
        assert_eq!(h.link.link_state(), LinkState::Disconnected);
        assert_eq!(h.link.local_status().inferred_state, InferredState::DeadUnreachable);
        assert_eq!(h.link.status_snapshot().call_attempts, 0);
    }

    #[tokio::test]
    async fn fetched_items_merge_in_chunks_while_syncing() {
        let mut h = Harness::new(1, RelayMode::Pair, |cfg| {
            cfg.relay.incoming_queue_capacity = 2;
            cfg.relay.fetch_timeout = 60_000;
        });
        let status = h.partner_item(T0, T0, h.default_config());
        h.push(status);
        h.link.init(&h.db).await.unwrap();
        h.poll().await;
        assert_eq!(h.link.link_state(), LinkState::InitialSync);

        let items = [done("a", T0 - 30), done("b", T0 - 20), done("c", T0 - 10)];
        let sink = h.script().sink.clone().unwrap();
        assert_eq!(sink.limit(), 2);
        h.clock.advance_ms(30_000);
        sink.extend(items.clone());

        h.poll().await;
        assert_eq!(h.link.link_state(), LinkState::InitialSync);
        assert!(h.db.relay.get(&items[1].relay_id).await.unwrap().is_some());
        assert!(h.db.relay.get(&items[2].relay_id).await.unwrap().is_none());

        h.poll().await;
        assert!(h.db.relay.get(&items[2].relay_id).await.unwrap().is_some());

        // the last chunk arrived at T0 + 30s, so the fetch may stall until T0 + 90s
        h.clock.advance_ms(59_999);
        h.poll().await;
        assert_eq!(h.link.link_state(), LinkState::InitialSync);

        h.finish_fetch(vec![done("d", T0 - 5)]);
        h.poll().await;
        assert_eq!(h.link.link_state(), LinkState::Connected);
        let merged = h.db.relay.get(&RelayId::new(RelayItemKind::Completion, "d")).await;
        assert!(merged.unwrap().is_some());
    }

    #[tokio::test]
    async fn pair_primary_takes_over_after_init_timeout() {
        let mut h = Harness::new(1, RelayMode::Pair, |_| {});
        h.script().start_ok = false;

        h.link.init(&h.db).await.unwrap();
        assert_eq!(h.link.link_state(), LinkState::Disconnected);
        assert_eq!(h.link.local_status().inferred_state, InferredState::Listening);
        assert_eq!(h.link.primary_state(), PrimaryState::Initializing);

        h.clock.advance_ms(599_999);
        h.poll().await;
        assert_eq!(h.link.primary_state(), PrimaryState::Initializing);

        h.clock.advance_ms(1);
        h.poll().await;
        assert_eq!(h.link.primary_state(), PrimaryState::Primary);
        assert_eq!(h.roles(), [PrimaryState::Primary]);
    }

    #[tokio::test]
    async fn watch_secondary_never_times_out() {
        let mut h = Harness::new(2, RelayMode::Watch, |_| {});
        h.script().start_ok = false;
        h.link.init(&h.db).await.unwrap();

        h.clock.advance_ms(10 * 600_000);
        h.poll().await;
        assert_eq!(h.link.primary_state(), PrimaryState::Initializing);
        assert!(h.roles().is_empty());
    }

    #[tokio::test]
    async fn configured_secondary_settles_then_promotes_on_stale_heartbeat() {
        let mut h = Harness::new(2, RelayMode::Pair, |_| {});
        let status = h.partner_item(T0, T0, h.default_config());
        h.connect(status).await;
        assert_eq!(h.link.primary_state(), PrimaryState::Secondary);

        let stale = h.partner_item(T0 + 1, h.now() - 1_900_000, h.default_config());
        h.push(stale);
        h.poll().await;
        assert_eq!(h.link.primary_state(), PrimaryState::Primary);
        assert_eq!(h.roles(), [PrimaryState::Secondary, PrimaryState::Primary]);
    }

    #[tokio::test]
    async fn unhealthy_partner_lets_secondary_promote() {
        let mut h = Harness::new(2, RelayMode::Pair, |_| {});
        let status = h.partner_item(T0, T0, h.default_config());
        h.connect(status).await;

        let mut sick = ServerStatus::new(1, h.default_config(), T0);
        sick.link_state = LinkState::Connected;
        sick.heartbeat_time = h.now();
        sick.health_status = health::PUBLISH_FAILED;
        h.push(sick.to_item(T0 + 5, "1-5"));
        h.poll().await;
        assert_eq!(h.link.primary_state(), PrimaryState::Primary);
    }

    #[tokio::test]
    async fn older_partner_status_is_ignored() {
        let mut h = Harness::new(2, RelayMode::Pair, |_| {});
        let status = h.partner_item(T0 + 10, T0, h.default_config());
        h.connect(status).await;

        let older = h.partner_item(T0 + 5, h.now() - 1_900_000, h.default_config());
        h.push(older);
        h.poll().await;
        assert_eq!(h.link.remote_status().unwrap().heartbeat_time, T0);
        assert_eq!(h.link.primary_state(), PrimaryState::Secondary);
    }

    #[tokio::test]
    async fn remote_status_converges_in_any_arrival_order() {
        let h = Harness::new(1, RelayMode::Pair, |_| {});
        let items = [
            h.partner_item(T0, T0, h.default_config()),
            h.partner_item(T0 + 1, T0 + 1, h.default_config()),
            h.partner_item(T0 + 1, T0 + 2, RelayConfig::new(1, RelayMode::Pair, 1)),
        ];
        let newest = items.iter().max().unwrap().clone();

        let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        for order in orders {
            let mut h = Harness::new(1, RelayMode::Pair, |_| {});
            for i in order {
                h.link.merge_remote_status(items[i].clone()).unwrap();
            }
            assert_eq!(h.link.remote_status_item.as_ref(), Some(&newest), "{order:?}");
        }
    }

    #[tokio::test]
    async fn garbage_while_connected_forces_disconnect() {
        let mut h = Harness::new(1, RelayMode::Pair, |_| {});
        let status = h.partner_item(T0, T0, h.default_config());
        h.connect(status).await;
        let shutdowns = h.script().shutdowns;

        h.push(RelayItem::new(RelayId::from_raw("bogus:1"), T0, "2-1", vec![]));
        h.push(done("after", T0));
        h.poll().await;
        assert_eq!(h.link.link_state(), LinkState::Disconnected);
        assert_eq!(h.link.local_status().inferred_state, InferredState::DeadBadSyncData);
        assert!(h.script().shutdowns > shutdowns);
        assert_eq!(h.link.status_snapshot().next_call_time, Some(h.now()));
    }

    #[tokio::test]
    async fn status_from_wrong_server_is_bad_state() {
        let mut h = Harness::new(1, RelayMode::Pair, |cfg| cfg.relay.listening_attempt_limit = 0);
        let mut own = ServerStatus::new(1, RelayConfig::new(0, RelayMode::Pair, 1), T0);
        own.link_state = LinkState::Connected;
        h.push(own.to_item(T0, "1-1"));

        h.link.init(&h.db).await.unwrap();
        h.poll().await;
        assert_eq!(h.link.link_state(), LinkState::Disconnected);
        assert_eq!(h.link.local_status().inferred_state, InferredState::DeadBadState);
    }

    #[tokio::test]
    async fn resync_cadence_follows_counter() {
        let mut h = Harness::new(1, RelayMode::Pair, |_| {});
        let status = h.partner_item(T0, T0, h.default_config());
        h.connect(status).await;

        // (wait, expected lookback)
        let steps = [
            (60_000, 2_592_000_000),
            (60_000, 2_592_000_000),
            (600_000, 2_592_000_000),
            (600_000, 3_600_000),
        ];
        for (i, (wait, lookback)) in steps.into_iter().enumerate() {
            h.clock.advance_ms(wait - 1);
            h.poll().await;
            assert_eq!(h.link.link_state(), LinkState::Connected, "step {i}: resync too early");

            h.clock.advance_ms(1);
            h.poll().await;
            assert_eq!(h.link.link_state(), LinkState::Resync, "step {i}");
            let (lo, _) = *h.script().fetches.last().unwrap();
            assert_eq!(lo, h.now() - lookback, "step {i}");

            h.finish_fetch(vec![]);
            h.poll().await;
            assert_eq!(h.link.link_state(), LinkState::Connected);
        }
        assert_eq!(h.link.status_snapshot().resync_counter, 2);
    }

    #[tokio::test]
    async fn newer_partner_config_is_adopted() {
        let mut h = Harness::new(2, RelayMode::Pair, |_| {});
        let newer = RelayConfig::new(5, RelayMode::Pair, 1);
        let status = h.partner_item(T0, T0, newer.clone());
        h.connect(status).await;

        assert_eq!(h.link.local_status().relay_config, newer);
        assert_eq!(h.link.primary_state(), PrimaryState::Secondary);
        assert_eq!(h.persisted().await.relay_config.mode_timestamp, 5);
    }

    #[tokio::test]
    async fn set_relay_config_outranks_both_servers_and_restarts() {
        let mut h = Harness::new(1, RelayMode::Pair, |_| {});
        let status = h.partner_item(T0, T0, RelayConfig::new(7, RelayMode::Pair, 1));
        h.connect(status).await;
        let shutdowns = h.script().shutdowns;

        let cfg = h.link.set_relay_config(&h.db, RelayMode::Solo, 2).await.unwrap();
        assert_eq!(cfg.mode_timestamp, 8);
        assert!(h.script().shutdowns > shutdowns);
        assert_eq!(h.link.link_state(), LinkState::Solo);
        assert_eq!(h.link.primary_state(), PrimaryState::Secondary);

        let persisted = h.persisted().await;
        assert_eq!(persisted.relay_config, cfg);
    }

    #[tokio::test]
    async fn persisted_newer_config_survives_restart() {
        let mut h = Harness::new(1, RelayMode::Pair, |_| {});
        h.script().start_ok = false;
        h.link.init(&h.db).await.unwrap();
        h.link.set_relay_config(&h.db, RelayMode::Solo, 1).await.unwrap();

        h.link.init(&h.db).await.unwrap();
        assert_eq!(h.link.local_status().relay_config.relay_mode, RelayMode::Solo);
        assert_eq!(h.link.link_state(), LinkState::Solo);
    }

    #[tokio::test]
    async fn submitted_items_get_stamps_and_increasing_times() {
        let mut h = Harness::new(1, RelayMode::Solo, |_| {});
        h.link.init(&h.db).await.unwrap();

        let a = h
            .link
            .submit_relay_item(
                &h.db,
                RelayId::new(RelayItemKind::Completion, "ev1"),
                b"{}".to_vec(),
            )
            .await
            .unwrap();
        let b = h
            .link
            .submit_relay_item(&h.db, RelayId::new(RelayItemKind::Removal, "ev1"), b"{}".to_vec())
            .await
            .unwrap();
        assert!(b.relay_time > a.relay_time);
        assert!(a.relay_stamp.starts_with("1-"));
        assert_eq!(h.local.relay.items().len(), 2);

        let err = h
            .link
            .submit_relay_item(&h.db, RelayId::server_status(1), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, MergeError::ReservedKind(_)));
    }

    #[tokio::test]
    async fn heartbeat_forces_a_status_write() {
        let mut h = Harness::new(1, RelayMode::Solo, |_| {});
        h.link.init(&h.db).await.unwrap();
        let first = h.db.relay.get_status(1).await.unwrap().unwrap().relay_time;

        h.clock.advance_ms(300_000);
        h.poll().await;
        assert_eq!(h.db.relay.get_status(1).await.unwrap().unwrap().relay_time, first);

        h.clock.advance_ms(1);
        h.poll().await;
        let status = h.persisted().await;
        assert_eq!(status.heartbeat_time, h.now());
    }

    #[tokio::test]
    async fn health_changes_are_published() {
        let mut h = Harness::new(1, RelayMode::Solo, |_| {});
        h.link.init(&h.db).await.unwrap();
        h.link.set_health(health::FEED_FAILED);
        h.poll().await;
        assert_eq!(h.persisted().await.health_status, health::FEED_FAILED);
    }

    #[tokio::test]
    async fn store_failure_propagates_out_of_poll() {
        let mut h = Harness::new(1, RelayMode::Pair, |_| {});
        let status = h.partner_item(T0, T0, h.default_config());
        h.connect(status).await;

        h.local.relay.set_online(false);
        h.push(done("ev", T0));
        assert!(h.link.poll(&h.db).await.is_err());
    }

    #[tokio::test]
    async fn shutdown_publishes_final_status() {
        let mut h = Harness::new(1, RelayMode::Pair, |_| {});
        let status = h.partner_item(T0, T0, h.default_config());
        h.connect(status).await;

        h.link.shutdown(&h.db).await.unwrap();
        let persisted = h.persisted().await;
        assert_eq!(persisted.link_state, LinkState::Shutdown);
        assert_eq!(persisted.primary_state, PrimaryState::Shutdown);
        assert!(h.script().terminated);

        // polling after shutdown does nothing
        h.poll().await;
        assert_eq!(h.link.link_state(), LinkState::Shutdown);
    }
}
