//! InMemoryRelayStore - 開発用のリレーログ
//!
//! # 実装詳細
//! - 通常アイテムは `RelayId` ごとに一件
//! - サーバーステータスは別枠で、サーバー番号ごとに一件
//! - 全ての書き込みは変更ストリームにも追記される（シーケンス番号 = 添字）

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::domain::{RelayId, RelayItem, ServerStatus};
use crate::ports::{MergeAction, RelayAuditEntry, RelayStore, RelayStoreError};

#[derive(Default)]
struct RelayState {
    items: BTreeMap<RelayId, RelayItem>,
    statuses: BTreeMap<u8, RelayItem>,
    changes: Vec<RelayItem>,
    audit: Vec<RelayAuditEntry>,
}

impl RelayState {
    fn write(&mut self, item: &RelayItem) {
        self.items.insert(item.relay_id.clone(), item.clone());
        self.changes.push(item.clone());
    }
}

#[derive(Clone)]
pub struct InMemoryRelayStore {
    state: Arc<Mutex<RelayState>>,
    online: Arc<AtomicBool>,
}

impl Default for InMemoryRelayStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRelayStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState::default())),
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate the database going away; every call fails until restored.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn items(&self) -> Vec<RelayItem> {
        let mut items: Vec<RelayItem> = self.lock().items.values().cloned().collect();
        items.sort();
        items
    }

    pub fn audit_entries(&self) -> Vec<RelayAuditEntry> {
        self.lock().audit.clone()
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn checked(&self) -> Result<MutexGuard<'_, RelayState>, RelayStoreError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(self.lock())
        } else {
            Err(RelayStoreError::Unavailable("relay store offline".to_string()))
        }
    }
}

#[async_trait]
impl RelayStore for InMemoryRelayStore {
    async fn insert_if_absent(&self, item: &RelayItem) -> Result<MergeAction, RelayStoreError> {
        let mut state = self.checked()?;
        if state.items.contains_key(&item.relay_id) {
            return Ok(MergeAction::Ignored);
        }
        state.write(item);
        Ok(MergeAction::Inserted)
    }

    async fn insert_if_newer(&self, item: &RelayItem) -> Result<MergeAction, RelayStoreError> {
        let mut state = self.checked()?;
        let action = match state.items.get(&item.relay_id) {
            None => MergeAction::Inserted,
            Some(existing) if item.is_newer_than(existing) => MergeAction::Replaced,
            Some(_) => return Ok(MergeAction::Ignored),
        };
        state.write(item);
        Ok(action)
    }

    async fn put_status(&self, item: &RelayItem) -> Result<(), RelayStoreError> {
        let status = ServerStatus::from_item(item)
            .map_err(|e| RelayStoreError::Unavailable(format!("refusing bad status item: {e}")))?;
        let mut state = self.checked()?;
        state.statuses.insert(status.server_number, item.clone());
        state.changes.push(item.clone());
        Ok(())
    }

    async fn get_status(&self, server_number: u8) -> Result<Option<RelayItem>, RelayStoreError> {
        Ok(self.checked()?.statuses.get(&server_number).cloned())
    }

    async fn get(&self, relay_id: &RelayId) -> Result<Option<RelayItem>, RelayStoreError> {
        Ok(self.checked()?.items.get(relay_id).cloned())
    }

    async fn query_range(&self, lo: i64, hi: i64) -> Result<Vec<RelayItem>, RelayStoreError> {
        let state = self.checked()?;
        let mut out: Vec<RelayItem> = state
            .items
            .values()
            .chain(state.statuses.values())
            .filter(|item| (lo..=hi).contains(&item.relay_time))
            .cloned()
            .collect();
        out.sort();
        Ok(out)
    }

    async fn changes_since(
        &self,
        seq: u64,
        limit: usize,
    ) -> Result<(Vec<RelayItem>, u64), RelayStoreError> {
        let state = self.checked()?;
        let start = usize::try_from(seq).unwrap_or(usize::MAX).min(state.changes.len());
        let end = start.saturating_add(limit).min(state.changes.len());
        let batch = state.changes[start..end].to_vec();
        Ok((batch, end as u64))
    }

    async fn head_seq(&self) -> Result<u64, RelayStoreError> {
        Ok(self.checked()?.changes.len() as u64)
    }

    async fn audit(&self, entry: RelayAuditEntry) -> Result<(), RelayStoreError> {
        self.checked()?.audit.push(entry);
        Ok(())
    }
}
