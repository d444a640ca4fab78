//! RoleListener port: side effects of a primary/secondary flip.
//!
//! The relay link calls these after every role change so the task layer can
//! cancel work that was queued under the previous role.

use async_trait::async_trait;

use crate::ports::DbHandle;

#[async_trait]
pub trait RoleListener: Send + Sync {
    async fn on_primary(&self, db: &DbHandle);

    async fn on_secondary(&self, db: &DbHandle);
}

/// Listener that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRoleListener;

#[async_trait]
impl RoleListener for NoopRoleListener {
    async fn on_primary(&self, _db: &DbHandle) {}

    async fn on_secondary(&self, _db: &DbHandle) {}
}
