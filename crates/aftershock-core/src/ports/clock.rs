//! Clock port.
//!
//! Two time sources are exposed:
//! - **true time**: wall clock; drives backoff, heartbeats and timeouts.
//! - **effective time**: the time tasks are scheduled against. Normally equal
//!   to true time, but may be frozen or offset for deterministic replay.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, TimeZone, Utc};

pub trait Clock: Send + Sync {
    fn true_time(&self) -> DateTime<Utc>;

    fn effective_time(&self) -> DateTime<Utc> {
        self.true_time()
    }

    fn true_ms(&self) -> i64 {
        self.true_time().timestamp_millis()
    }

    fn effective_ms(&self) -> i64 {
        self.effective_time().timestamp_millis()
    }
}

/// Production clock: both sources read the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn true_time(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

const FOLLOW_TRUE: i64 = i64::MIN;

/// Manually driven clock for tests and replay.
///
/// Effective time follows true time unless frozen with `freeze_effective`.
#[derive(Debug)]
pub struct FixedClock {
    true_ms: AtomicI64,
    effective_ms: AtomicI64,
}

impl FixedClock {
    pub fn new(time: DateTime<Utc>) -> Self {
        Self::from_millis(time.timestamp_millis())
    }

    pub fn from_millis(ms: i64) -> Self {
        Self {
            true_ms: AtomicI64::new(ms),
            effective_ms: AtomicI64::new(FOLLOW_TRUE),
        }
    }

    pub fn set_ms(&self, ms: i64) {
        self.true_ms.store(ms, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, delta: i64) {
        self.true_ms.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn freeze_effective(&self, ms: i64) {
        self.effective_ms.store(ms, Ordering::SeqCst);
    }

    pub fn thaw_effective(&self) {
        self.effective_ms.store(FOLLOW_TRUE, Ordering::SeqCst);
    }
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl Clock for FixedClock {
    fn true_time(&self) -> DateTime<Utc> {
        from_ms(self.true_ms())
    }

    fn effective_time(&self) -> DateTime<Utc> {
        from_ms(self.effective_ms())
    }

    fn true_ms(&self) -> i64 {
        self.true_ms.load(Ordering::SeqCst)
    }

    fn effective_ms(&self) -> i64 {
        match self.effective_ms.load(Ordering::SeqCst) {
            FOLLOW_TRUE => self.true_ms(),
            frozen => frozen,
        }
    }
}
