//! Key generation port.
//!
//! Keys are ULIDs stamped with the clock's true time, so a `FixedClock` gives
//! keys with a deterministic timestamp part.

use std::sync::Arc;

use crate::domain::RecordKey;
use crate::ports::Clock;

pub trait KeyGenerator: Send + Sync {
    fn generate_record_key(&self) -> RecordKey;
}

pub struct UlidKeyGenerator {
    clock: Arc<dyn Clock>,
}

impl UlidKeyGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl KeyGenerator for UlidKeyGenerator {
    fn generate_record_key(&self) -> RecordKey {
        let timestamp_ms = self.clock.true_ms().max(0) as u64;
        RecordKey::from_parts(timestamp_ms, rand::random())
    }
}
