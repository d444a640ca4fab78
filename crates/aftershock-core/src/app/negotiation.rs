//! Primary/secondary negotiation.
//!
//! # 設計原則
//! - Pure functions of the link's view of the partner; no I/O.
//! - WATCH: the configured secondary never times out of `Initializing`.
//! - PAIR: a primary only steps down on positive confirmation.
//! - `dead_or_synced` does not look at partner health; only `known_dead`
//!   and `alive_and_synced` do.

use crate::domain::{LinkState, PrimaryState, RelayConfig, RelayMode, ServerStatus};

/// What this server can tell about its partner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Liveness {
    pub known_dead: bool,
    pub alive_and_synced: bool,
    pub dead_or_synced: bool,
}

/// Inputs of `Liveness::assess`.
#[derive(Debug, Clone, Copy)]
pub struct LinkView<'a> {
    pub link_state: LinkState,
    /// Failed call attempts exceed the loss threshold.
    pub connection_lost: bool,
    pub local_config: &'a RelayConfig,
    pub remote: Option<&'a ServerStatus>,
    pub now: i64,
    pub heartbeat_stale: i64,
}

impl Liveness {
    pub fn assess(view: &LinkView<'_>) -> Self {
        let lost = view.link_state == LinkState::Disconnected && view.connection_lost;
        let connected = view.link_state.is_connected();

        // With no partner status there is nothing fresh to trust.
        let stale = view
            .remote
            .is_none_or(|r| view.now - r.heartbeat_time > view.heartbeat_stale);
        let healthy = view.remote.is_some_and(ServerStatus::is_healthy);
        let same_config = view.remote.is_some_and(|r| r.relay_config == *view.local_config);

        Self {
            known_dead: lost || (connected && (stale || !healthy)),
            alive_and_synced: connected && same_config && !stale,
            dead_or_synced: lost || (connected && stale) || (connected && same_config),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NegotiationInput {
    pub current: PrimaryState,
    pub relay_mode: RelayMode,
    pub server_number: u8,
    pub configured_primary: u8,
    pub liveness: Liveness,
    /// The startup timeout has elapsed.
    pub init_timed_out: bool,
    /// The link is connected or disconnected, not in between.
    pub link_definite: bool,
}

impl NegotiationInput {
    fn is_configured_primary(&self) -> bool {
        self.server_number == self.configured_primary
    }

    fn timed_out(&self) -> bool {
        self.init_timed_out && self.link_definite
    }
}

/// Next primary state.
pub fn negotiate(input: &NegotiationInput) -> PrimaryState {
    use PrimaryState::*;

    if input.current == Shutdown {
        return Shutdown;
    }
    let live = input.liveness;

    match input.relay_mode {
        RelayMode::Solo => {
            if input.is_configured_primary() {
                Primary
            } else {
                Secondary
            }
        }

        RelayMode::Watch => match input.current {
            Initializing if input.is_configured_primary() => {
                if live.dead_or_synced || input.timed_out() {
                    Primary
                } else {
                    Initializing
                }
            }
            Initializing => {
                if live.alive_and_synced {
                    Secondary
                } else {
                    Initializing
                }
            }
            resolved => resolved,
        },

        RelayMode::Pair => match input.current {
            Primary => {
                if !input.is_configured_primary() && live.alive_and_synced {
                    Secondary
                } else {
                    Primary
                }
            }
            Secondary => {
                let step_up = if input.is_configured_primary() {
                    live.dead_or_synced
                } else {
                    live.known_dead
                };
                if step_up { Primary } else { Secondary }
            }
            Initializing if input.is_configured_primary() => {
                if live.dead_or_synced || input.timed_out() {
                    Primary
                } else {
                    Initializing
                }
            }
            Initializing => {
                if live.alive_and_synced || input.timed_out() {
                    Secondary
                } else {
                    Initializing
                }
            }
            Shutdown => Shutdown,
        },
    }
}
