//! RelayStore port: the local append-only relay log.
//!
//! The log is the only replication transport between the two servers. Items
//! are immutable once written; merges are idempotent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{RelayId, RelayItem};

#[derive(Debug, thiserror::Error)]
pub enum RelayStoreError {
    #[error("relay store unavailable: {0}")]
    Unavailable(String),
}

/// Result of merging one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeAction {
    Inserted,
    Replaced,
    Ignored,
}

/// Audit trail of merges of remote items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayAuditEntry {
    pub relay_id: RelayId,
    pub relay_time: i64,
    pub action: MergeAction,
    pub log_time: i64,
}

#[async_trait]
pub trait RelayStore: Send + Sync {
    /// Insert unless an item with the same id exists.
    async fn insert_if_absent(&self, item: &RelayItem) -> Result<MergeAction, RelayStoreError>;

    /// Insert, or replace an existing item with the same id if `item` is
    /// strictly newer under the total order.
    async fn insert_if_newer(&self, item: &RelayItem) -> Result<MergeAction, RelayStoreError>;

    /// Overwrite this server's own status record.
    async fn put_status(&self, item: &RelayItem) -> Result<(), RelayStoreError>;

    async fn get_status(&self, server_number: u8) -> Result<Option<RelayItem>, RelayStoreError>;

    async fn get(&self, relay_id: &RelayId) -> Result<Option<RelayItem>, RelayStoreError>;

    /// Items (status included) with `lo <= relay_time <= hi`, in total order.
    async fn query_range(&self, lo: i64, hi: i64) -> Result<Vec<RelayItem>, RelayStoreError>;

    /// Change stream: up to `limit` writes with sequence `>= seq`, and the
    /// sequence to resume from.
    async fn changes_since(
        &self,
        seq: u64,
        limit: usize,
    ) -> Result<(Vec<RelayItem>, u64), RelayStoreError>;

    /// Sequence number the next write will get.
    async fn head_seq(&self) -> Result<u64, RelayStoreError>;

    async fn audit(&self, entry: RelayAuditEntry) -> Result<(), RelayStoreError>;
}
