//! Retry policies: dispatcher restart backoff and relay call retry schedule.

use std::time::Duration;

use crate::config::{DispatcherConfig, RelayLinkConfig};

/// Delay before the dispatcher reconnects after a loop failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl RestartPolicy {
    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self {
            min_delay: Duration::from_millis(config.restart_delay_min),
            max_delay: Duration::from_millis(config.restart_delay_max),
        }
    }

    /// `max(min_delay, max_delay - elapsed)`.
    ///
    /// `elapsed` is the time since the previous restart; a loop that ran for
    /// longer than `max_delay` restarts after only `min_delay`.
    ///
    /// Example with min=20s, max=300s:
    /// - failed immediately after the last restart: 300s
    /// - ran for 100s: 200s
    /// - ran for an hour: 20s
    pub fn restart_delay(&self, elapsed: Duration) -> Duration {
        self.max_delay.saturating_sub(elapsed).max(self.min_delay)
    }
}

/// Schedule of connection attempts to the partner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallRetryPolicy {
    pub short_limit: u32,
    pub short_interval: Duration,
    pub long_interval: Duration,
    pub loss_conn: u32,
}

impl CallRetryPolicy {
    pub fn from_config(config: &RelayLinkConfig) -> Self {
        Self {
            short_limit: config.call_retry_short_limit,
            short_interval: Duration::from_millis(config.call_retry_short_interval),
            long_interval: Duration::from_millis(config.call_retry_long_interval),
            loss_conn: config.call_retry_loss_conn,
        }
    }

    /// Wait before attempt number `attempt` (1-based) of a reconnection run.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            Duration::ZERO
        } else if attempt <= 1 + self.short_limit {
            self.short_interval
        } else {
            self.long_interval
        }
    }

    /// The connection is lost once failed attempts exceed `loss_conn + 1`.
    pub fn is_lost(&self, attempts: u32) -> bool {
        attempts > self.loss_conn + 1
    }
}
