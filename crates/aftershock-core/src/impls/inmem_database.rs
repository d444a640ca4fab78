//! InMemoryDatabase - 開発用のデータベース（タスクキュー + リレーログ）
//!
//! Each server of the demo owns one of these; the partner reaches it through
//! the same `Connector`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::impls::InMemoryRelayStore;
use crate::ports::{Clock, ConnectError, Connector, DbHandle, UlidKeyGenerator};
use crate::queue::InMemoryTaskQueue;

pub struct InMemoryDatabase {
    server_number: u8,
    pub tasks: InMemoryTaskQueue,
    pub relay: InMemoryRelayStore,
    reachable: AtomicBool,
    fail_next_connects: AtomicU32,
}

impl InMemoryDatabase {
    pub fn new(server_number: u8, clock: Arc<dyn Clock>) -> Self {
        Self {
            server_number,
            tasks: InMemoryTaskQueue::new(Arc::new(UlidKeyGenerator::new(clock))),
            relay: InMemoryRelayStore::new(),
            reachable: AtomicBool::new(true),
            fail_next_connects: AtomicU32::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_next_connects.store(n, Ordering::SeqCst);
    }

    /// Handle that bypasses the reachability switch.
    pub fn handle(&self) -> DbHandle {
        DbHandle {
            tasks: Arc::new(self.tasks.clone()),
            relay: Arc::new(self.relay.clone()),
        }
    }

    fn unreachable(&self, reason: &str) -> ConnectError {
        ConnectError::Unreachable {
            server: self.server_number,
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Connector for InMemoryDatabase {
    fn server_number(&self) -> u8 {
        self.server_number
    }

    async fn connect(&self) -> Result<DbHandle, ConnectError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(self.unreachable("database offline"));
        }
        let failed = self
            .fail_next_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(self.unreachable("injected connect failure"));
        }
        Ok(self.handle())
    }
}
