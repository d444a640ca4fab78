//! Server configuration.
//!
//! One `ServerConfig` is loaded at startup and shared through a
//! `ConfigHandle`. The dispatcher and the relay link read the handle at the
//! start of each cycle, so `ConfigHandle::reload` takes effect on the next
//! cycle without any global state.
//!
//! All durations are milliseconds.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::domain::{RelayMode, SCHED_TIME_EARLY_LIMIT};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub dispatcher: DispatcherConfig,
    pub relay: RelayLinkConfig,
    pub resync: ResyncConfig,
    pub negotiation: NegotiationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// 1 or 2.
    pub server_number: u8,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self { server_number: 1 }
    }
}

impl ServerSection {
    pub fn partner_number(&self) -> u8 {
        3 - self.server_number
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub polling_delay: u64,
    pub min_sleep: u64,
    pub restart_delay_min: u64,
    pub restart_delay_max: u64,
    /// Consecutive ready cycles before idle time may be forced.
    pub idle_force_task_count: u32,
    pub idle_force_short_delay: u64,
    pub idle_force_long_delay: u64,
    /// Tasks scheduled at or below this are exempt from idle forcing.
    pub early_task_limit: i64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            polling_delay: 15_000,
            min_sleep: 1_000,
            restart_delay_min: 20_000,
            restart_delay_max: 300_000,
            idle_force_task_count: 50,
            idle_force_short_delay: 5_000,
            idle_force_long_delay: 300_000,
            early_task_limit: SCHED_TIME_EARLY_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayLinkConfig {
    pub call_retry_short_limit: u32,
    pub call_retry_short_interval: u64,
    pub call_retry_long_interval: u64,
    pub call_retry_loss_conn: u32,
    pub heartbeat_interval: u64,
    pub heartbeat_stale: u64,
    pub incoming_queue_capacity: usize,
    /// Call failures report the partner as `Listening` up to this many attempts.
    pub listening_attempt_limit: u32,
    /// Pause between change-stream polls of the transport worker.
    pub transport_poll_interval: u64,
    /// A sync fetch that delivers nothing for this long is given up.
    pub fetch_timeout: u64,
}

impl Default for RelayLinkConfig {
    fn default() -> Self {
        Self {
            call_retry_short_limit: 3,
            call_retry_short_interval: 30_000,
            call_retry_long_interval: 300_000,
            call_retry_loss_conn: 4,
            heartbeat_interval: 300_000,
            heartbeat_stale: 1_800_000,
            incoming_queue_capacity: 1_000,
            listening_attempt_limit: 2,
            transport_poll_interval: 500,
            fetch_timeout: 600_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResyncConfig {
    /// Number of quick resyncs right after connecting.
    pub quick_count: u32,
    pub quick_interval: u64,
    pub interval: u64,
    /// One deep resync per this many resyncs.
    pub cycle_length: u32,
    pub lookback_short: u64,
    pub lookback_long: u64,
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            quick_count: 2,
            quick_interval: 60_000,
            interval: 600_000,
            cycle_length: 48,
            lookback_short: 3_600_000,
            lookback_long: 2_592_000_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    pub prist_init_timeout: u64,
    #[serde(with = "relay_mode_name")]
    pub relay_mode: RelayMode,
    pub configured_primary: u8,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            prist_init_timeout: 600_000,
            relay_mode: RelayMode::Pair,
            configured_primary: 1,
        }
    }
}

/// Relay mode written as its name (`"solo"`, `"watch"`, `"pair"`) in TOML.
mod relay_mode_name {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    use crate::domain::RelayMode;

    pub fn serialize<S: Serializer>(mode: &RelayMode, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(mode.name())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<RelayMode, D::Error> {
        let name = String::deserialize(deserializer)?;
        RelayMode::from_name(&name)
            .ok_or_else(|| D::Error::custom(format!("unknown relay mode '{name}'")))
    }
}

impl ServerConfig {
    pub fn for_server(server_number: u8) -> Self {
        Self {
            server: ServerSection { server_number },
            ..Self::default()
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&s)
    }

    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let cfg: ServerConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if !(1..=2).contains(&self.server.server_number) {
            return invalid("server_number must be 1 or 2");
        }
        if !(1..=2).contains(&self.negotiation.configured_primary) {
            return invalid("configured_primary must be 1 or 2");
        }

        let d = &self.dispatcher;
        if d.restart_delay_min > d.restart_delay_max {
            return invalid("restart_delay_min exceeds restart_delay_max");
        }
        if d.min_sleep > d.polling_delay {
            return invalid("min_sleep exceeds polling_delay");
        }
        if [d.polling_delay, d.idle_force_short_delay, d.idle_force_long_delay].contains(&0) {
            return invalid("dispatcher delays must be positive");
        }

        let r = &self.relay;
        if [
            r.call_retry_short_interval,
            r.call_retry_long_interval,
            r.heartbeat_interval,
            r.heartbeat_stale,
            r.transport_poll_interval,
            r.fetch_timeout,
        ]
        .contains(&0)
        {
            return invalid("relay intervals must be positive");
        }
        if r.incoming_queue_capacity == 0 {
            return invalid("incoming_queue_capacity must be positive");
        }

        let s = &self.resync;
        if s.cycle_length == 0 {
            return invalid("resync cycle_length must be positive");
        }
        if [s.quick_interval, s.interval, s.lookback_short, s.lookback_long].contains(&0) {
            return invalid("resync intervals must be positive");
        }
        if s.lookback_short > s.lookback_long {
            return invalid("lookback_short exceeds lookback_long");
        }

        Ok(())
    }
}

/// Config durations as signed milliseconds for clock arithmetic.
pub(crate) fn as_ms(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Shared, reloadable reference to the current configuration.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<ServerConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn current(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Swap in `config` after validating it. The server number cannot change
    /// while running.
    pub fn reload(&self, config: ServerConfig) -> Result<(), ConfigError> {
        config.validate()?;
        let mut current = self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if current.server.server_number != config.server.server_number {
            return Err(ConfigError::Invalid("server_number cannot change on reload".to_string()));
        }
        *current = Arc::new(config);
        Ok(())
    }
}
