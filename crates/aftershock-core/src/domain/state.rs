//! Closed state enumerations shared by the dispatcher and the relay link.
//!
//! The link, primary, inferred and relay-mode enums travel inside the server
//! status exchanged between the two servers, so each variant carries a fixed
//! integer code. The codes are part of the wire protocol and must not change.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Raised when a wire code does not map to any variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} code {code}")]
pub struct UnknownCode {
    pub kind: &'static str,
    pub code: i32,
}

macro_rules! coded_enum {
    (
        $(#[$meta:meta])*
        $name:ident : $kind:literal {
            $( $(#[$vmeta:meta])* $variant:ident = $code:literal => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(into = "i32", try_from = "i32")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            pub fn code(self) -> i32 {
                match self {
                    $( $name::$variant => $code ),+
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $( $name::$variant => $label ),+
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $( $label => Some($name::$variant), )+
                    _ => None,
                }
            }
        }

        impl From<$name> for i32 {
            fn from(value: $name) -> i32 {
                value.code()
            }
        }

        impl TryFrom<i32> for $name {
            type Error = UnknownCode;

            fn try_from(code: i32) -> Result<Self, Self::Error> {
                match code {
                    $( $code => Ok($name::$variant), )+
                    _ => Err(UnknownCode { kind: $kind, code }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

coded_enum! {
    /// Connection lifecycle of the relay link.
    ///
    /// `Shutdown -> (Solo | Disconnected) -> Calling -> InitialSync -> Connected <-> Resync`,
    /// with every connected state falling back to `Disconnected` on failure.
    LinkState: "link state" {
        Shutdown = 1 => "shutdown",
        Solo = 2 => "solo",
        Disconnected = 3 => "disconnected",
        Calling = 4 => "calling",
        InitialSync = 5 => "initial_sync",
        Connected = 6 => "connected",
        Resync = 7 => "resync",
    }
}

impl LinkState {
    /// Synced at least once and still holding the partner session.
    pub fn is_connected(self) -> bool {
        matches!(self, LinkState::Connected | LinkState::Resync)
    }

    /// Connected or disconnected, as opposed to a transient calling/sync state.
    pub fn is_definite(self) -> bool {
        matches!(
            self,
            LinkState::Connected | LinkState::Resync | LinkState::Disconnected
        )
    }
}

coded_enum! {
    /// The partner's state as perceived from this server.
    InferredState: "inferred state" {
        Shutdown = 1 => "shutdown",
        Solo = 2 => "solo",
        Unknown = 3 => "unknown",
        Listening = 4 => "listening",
        DeadUnreachable = 5 => "dead_unreachable",
        DeadBadState = 6 => "dead_bad_state",
        DeadBadSyncData = 7 => "dead_bad_sync_data",
        DeadNotCallable = 8 => "dead_not_callable",
        Syncing = 9 => "syncing",
        Connected = 10 => "connected",
    }
}

coded_enum! {
    /// Negotiated role of a server.
    PrimaryState: "primary state" {
        Shutdown = 1 => "shutdown",
        Initializing = 2 => "initializing",
        Primary = 3 => "primary",
        Secondary = 4 => "secondary",
    }
}

impl PrimaryState {
    pub fn is_resolved(self) -> bool {
        matches!(self, PrimaryState::Primary | PrimaryState::Secondary)
    }
}

coded_enum! {
    /// Replication topology.
    RelayMode: "relay mode" {
        /// No partner.
        Solo = 1 => "solo",
        /// Static roles, no negotiation.
        Watch = 2 => "watch",
        /// Negotiated roles.
        Pair = 3 => "pair",
    }
}

coded_enum! {
    /// Where the dispatcher currently is. Any final value other than `Shutdown`
    /// names the phase in which a fatal failure happened.
    DispatcherState: "dispatcher state" {
        Initial = 1 => "initial",
        FirstConnect = 2 => "first_connect",
        Reconnecting = 3 => "reconnecting",
        RelayLinkInit = 4 => "relay_link_init",
        RelayLinkPoll = 5 => "relay_link_poll",
        Polling = 6 => "polling",
        Processing = 7 => "processing",
        IdleTime = 8 => "idle_time",
        Waiting = 9 => "waiting",
        Shutdown = 10 => "shutdown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for state in [
            LinkState::Shutdown,
            LinkState::Solo,
            LinkState::Disconnected,
            LinkState::Calling,
            LinkState::InitialSync,
            LinkState::Connected,
            LinkState::Resync,
        ] {
            assert_eq!(LinkState::try_from(state.code()), Ok(state));
        }
    }

    #[test]
    fn unknown_code_is_rejected() {
        let err = PrimaryState::try_from(99).unwrap_err();
        assert_eq!(err.code, 99);
        assert!(err.to_string().contains("primary state"));
    }

    #[test]
    fn serializes_as_integer_code() {
        let json = serde_json::to_string(&RelayMode::Pair).unwrap();
        assert_eq!(json, "3");
        let back: RelayMode = serde_json::from_str("2").unwrap();
        assert_eq!(back, RelayMode::Watch);
        assert!(serde_json::from_str::<RelayMode>("7").is_err());
    }

    #[test]
    fn names_parse_back() {
        assert_eq!(RelayMode::from_name("watch"), Some(RelayMode::Watch));
        assert_eq!(RelayMode::from_name("bogus"), None);
        assert_eq!(LinkState::Resync.to_string(), "resync");
    }

    #[test]
    fn definite_link_states() {
        assert!(LinkState::Disconnected.is_definite());
        assert!(LinkState::Resync.is_connected());
        assert!(!LinkState::Calling.is_definite());
        assert!(!LinkState::InitialSync.is_connected());
    }
}
