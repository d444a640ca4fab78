//! Database connection port.
//!
//! A `DbHandle` is the single explicit session a dispatcher works through; it
//! is passed down by reference instead of living in thread-local state.

use std::sync::Arc;

use async_trait::async_trait;

use crate::ports::{RelayStore, TaskQueue};

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("database for server {server} unreachable: {reason}")]
    Unreachable { server: u8, reason: String },
}

#[derive(Clone)]
pub struct DbHandle {
    pub tasks: Arc<dyn TaskQueue>,
    pub relay: Arc<dyn RelayStore>,
}

impl std::fmt::Debug for DbHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbHandle").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Server number owning the database behind this connector.
    fn server_number(&self) -> u8;

    async fn connect(&self) -> Result<DbHandle, ConnectError>;
}
