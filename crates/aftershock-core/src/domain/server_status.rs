//! Server status: the reserved relay-item payload describing one server.
//!
//! The serialized form starts with an integer schema version (`ver`), so a
//! receiver can decide how to read the rest before touching any other field.

use serde::{Deserialize, Serialize};

use super::relay_item::{RelayId, RelayItem, RelayItemKind};
use super::state::{InferredState, LinkState, PrimaryState, RelayMode};

/// Schema version written first in every serialized status.
pub const STATUS_SCHEMA_VERSION: i32 = 1;

/// Relay protocol version; partners must agree to connect.
pub const PROTOCOL_VERSION: i32 = 1;

pub const SOFTWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Health bits. Zero means healthy.
pub mod health {
    pub const OK: u32 = 0;
    pub const DB_DEGRADED: u32 = 1 << 0;
    pub const FEED_FAILED: u32 = 1 << 1;
    pub const PUBLISH_FAILED: u32 = 1 << 2;
    pub const ADMIN_UNHEALTHY: u32 = 1 << 3;
}

/// Replication configuration. Of two configs, the one with the larger
/// `mode_timestamp` wins; the timestamp is a logical counter, not wall time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    pub mode_timestamp: i64,
    pub relay_mode: RelayMode,
    pub configured_primary: u8,
}

impl RelayConfig {
    pub fn new(mode_timestamp: i64, relay_mode: RelayMode, configured_primary: u8) -> Self {
        Self {
            mode_timestamp,
            relay_mode,
            configured_primary,
        }
    }

    pub fn supersedes(&self, other: &RelayConfig) -> bool {
        self.mode_timestamp > other.mode_timestamp
    }

    /// Same topology and roles, ignoring the timestamp.
    pub fn same_roles(&self, other: &RelayConfig) -> bool {
        self.relay_mode == other.relay_mode && self.configured_primary == other.configured_primary
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatusFormatError {
    #[error("status payload is not valid: {0}")]
    Malformed(String),

    #[error("unknown status schema version {0}")]
    UnknownVersion(i32),

    #[error("relay item {0} is not a server status")]
    NotStatus(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub server_number: u8,
    pub software_version: String,
    pub protocol_version: i32,
    pub link_state: LinkState,
    /// The partner's state as perceived by this server.
    pub inferred_state: InferredState,
    pub relay_config: RelayConfig,
    pub primary_state: PrimaryState,
    pub start_time: i64,
    pub heartbeat_time: i64,
    pub health_status: u32,
}

#[derive(Serialize)]
struct StatusWireRef<'a> {
    ver: i32,
    #[serde(flatten)]
    status: &'a ServerStatus,
}

#[derive(Deserialize)]
struct VersionTag {
    ver: i32,
}

#[derive(Deserialize)]
struct StatusWireV1 {
    #[serde(flatten)]
    status: ServerStatus,
}

impl ServerStatus {
    pub fn new(server_number: u8, relay_config: RelayConfig, now: i64) -> Self {
        Self {
            server_number,
            software_version: SOFTWARE_VERSION.to_string(),
            protocol_version: PROTOCOL_VERSION,
            link_state: LinkState::Shutdown,
            inferred_state: InferredState::Unknown,
            relay_config,
            primary_state: PrimaryState::Initializing,
            start_time: now,
            heartbeat_time: now,
            health_status: health::OK,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health_status == health::OK
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let wire = StatusWireRef {
            ver: STATUS_SCHEMA_VERSION,
            status: self,
        };
        // Serializing plain data with integer-coded enums cannot fail.
        serde_json::to_vec(&wire).unwrap_or_default()
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, StatusFormatError> {
        let tag: VersionTag = serde_json::from_slice(payload)
            .map_err(|e| StatusFormatError::Malformed(e.to_string()))?;
        match tag.ver {
            1 => {
                let wire: StatusWireV1 = serde_json::from_slice(payload)
                    .map_err(|e| StatusFormatError::Malformed(e.to_string()))?;
                Ok(wire.status)
            }
            other => Err(StatusFormatError::UnknownVersion(other)),
        }
    }

    pub fn from_item(item: &RelayItem) -> Result<Self, StatusFormatError> {
        if item.kind() != Ok(RelayItemKind::ServerStatus) {
            return Err(StatusFormatError::NotStatus(item.relay_id.to_string()));
        }
        Self::from_payload(&item.payload)
    }

    pub fn to_item(&self, relay_time: i64, relay_stamp: impl Into<String>) -> RelayItem {
        RelayItem::new(
            RelayId::server_status(self.server_number),
            relay_time,
            relay_stamp,
            self.to_payload(),
        )
    }

    /// Whether a partner publishing this status can be connected to by
    /// `local`: right server number, same protocol, not shut down.
    pub fn is_connectable_from(&self, local: &ServerStatus) -> bool {
        self.server_number != local.server_number
            && (1..=2).contains(&self.server_number)
            && self.protocol_version == local.protocol_version
            && self.link_state != LinkState::Shutdown
            && self.primary_state != PrimaryState::Shutdown
    }
}
