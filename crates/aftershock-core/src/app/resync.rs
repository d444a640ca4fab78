//! Resync cadence.
//!
//! The counter runs from `-quick_count` (set on every new connection) up to
//! `cycle_length - 1` and wraps to 0. Negative values are quick resyncs with
//! the long lookback; 0 is the single deep resync of each cycle; everything
//! else is a normal resync with the short lookback.

use crate::config::{ResyncConfig, as_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResyncPlan {
    /// Delay from the end of the previous sync to this resync (ms).
    pub interval: i64,
    /// How far back this resync fetches (ms).
    pub lookback: i64,
}

impl ResyncPlan {
    pub fn is_deep(&self, config: &ResyncConfig) -> bool {
        self.lookback == as_ms(config.lookback_long)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncCycle {
    counter: i64,
}

impl ResyncCycle {
    pub fn counter(&self) -> i64 {
        self.counter
    }

    /// Reset for a fresh connection.
    pub fn prime(&mut self, config: &ResyncConfig) {
        self.counter = -i64::from(config.quick_count);
    }

    /// Plan for the next resync at the current counter value.
    pub fn plan(&self, config: &ResyncConfig) -> ResyncPlan {
        if self.counter < 0 {
            ResyncPlan {
                interval: as_ms(config.quick_interval),
                lookback: as_ms(config.lookback_long),
            }
        } else if self.counter == 0 {
            ResyncPlan {
                interval: as_ms(config.interval),
                lookback: as_ms(config.lookback_long),
            }
        } else {
            ResyncPlan {
                interval: as_ms(config.interval),
                lookback: as_ms(config.lookback_short),
            }
        }
    }

    /// Step past a completed resync.
    pub fn advance(&mut self, config: &ResyncConfig) {
        self.counter += 1;
        if self.counter >= i64::from(config.cycle_length) {
            self.counter = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config() -> ResyncConfig {
        ResyncConfig::default()
    }

    #[test]
    fn first_resyncs_after_connect_are_quick_and_long() {
        let cfg = config();
        let mut cycle = ResyncCycle::default();
        cycle.prime(&cfg);

        for _ in 0..cfg.quick_count {
            let plan = cycle.plan(&cfg);
            assert_eq!(plan.interval, 60_000);
            assert_eq!(plan.lookback, 2_592_000_000);
            cycle.advance(&cfg);
        }
        assert_eq!(cycle.counter(), 0);
        assert_eq!(cycle.plan(&cfg).interval, 600_000);
    }

    #[test]
    fn one_deep_resync_per_cycle() {
        let cfg = config();
        let mut cycle = ResyncCycle::default();
        cycle.prime(&cfg);
        while cycle.counter() < 0 {
            cycle.advance(&cfg);
        }

        let mut deep = 0;
        for _ in 0..cfg.cycle_length {
            if cycle.plan(&cfg).is_deep(&cfg) {
                deep += 1;
            }
            cycle.advance(&cfg);
        }
        assert_eq!(deep, 1);
        assert_eq!(cycle.counter(), 0);
    }

    #[rstest]
    #[case(-2, 60_000, 2_592_000_000)]
    #[case(-1, 60_000, 2_592_000_000)]
    #[case(0, 600_000, 2_592_000_000)]
    #[case(1, 600_000, 3_600_000)]
    #[case(47, 600_000, 3_600_000)]
    fn plan_by_counter(#[case] counter: i64, #[case] interval: i64, #[case] lookback: i64) {
        let cycle = ResyncCycle { counter };
        assert_eq!(cycle.plan(&config()), ResyncPlan { interval, lookback });
    }

    #[test]
    fn reconnect_reprimes_mid_cycle() {
        let cfg = config();
        let mut cycle = ResyncCycle { counter: 17 };
        cycle.prime(&cfg);
        assert_eq!(cycle.counter(), -2);
    }
}
