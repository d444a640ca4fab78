//! RelayTransport port: the background worker that owns the session to the
//! partner's database.
//!
//! Every method is non-blocking. The relay link polls `status()` and drains
//! `dequeue_item()` each cycle; the worker does its blocking I/O elsewhere.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::domain::{InferredState, RelayItem};
use crate::ports::Connector;

/// Why a call to the partner failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallFailure {
    /// The partner database could not be reached.
    Unreachable,
    /// The partner was reached but its state forbids connecting.
    BadState,
    /// Data received from the partner could not be understood.
    BadSyncData,
    /// The worker could not be started at all.
    NotCallable,
}

impl CallFailure {
    pub fn dead_state(self) -> InferredState {
        match self {
            CallFailure::Unreachable => InferredState::DeadUnreachable,
            CallFailure::BadState => InferredState::DeadBadState,
            CallFailure::BadSyncData => InferredState::DeadBadSyncData,
            CallFailure::NotCallable => InferredState::DeadNotCallable,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    /// Never started.
    Idle,
    Starting,
    Running,
    Failed(CallFailure),
    /// Stopped after `shutdown`/`terminate`.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Idle,
    Active,
    Finished,
    Failed,
}

/// Buffer receiving the items of a bulk fetch.
///
/// A bounded sink holds at most `limit` items; the worker waits for `room()`
/// before adding a chunk and the link drains it with `take_up_to` while the
/// fetch runs.
#[derive(Debug)]
pub struct FetchSink {
    items: Mutex<VecDeque<RelayItem>>,
    limit: usize,
}

impl Default for FetchSink {
    fn default() -> Self {
        Self::bounded(usize::MAX)
    }
}

impl FetchSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bounded(limit: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Items that can still be added without passing the limit.
    pub fn room(&self) -> usize {
        self.limit.saturating_sub(self.len())
    }

    /// Appends regardless of the limit; producers check `room()` first.
    pub fn extend(&self, items: impl IntoIterator<Item = RelayItem>) {
        self.lock().extend(items);
    }

    pub fn take(&self) -> Vec<RelayItem> {
        std::mem::take(&mut *self.lock()).into()
    }

    /// Removes the oldest `n` items at most.
    pub fn take_up_to(&self, n: usize) -> Vec<RelayItem> {
        let mut items = self.lock();
        let n = n.min(items.len());
        items.drain(..n).collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<RelayItem>> {
        self.items.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub trait RelayTransport: Send {
    /// Start a worker against the partner. With `with_status_read`, the first
    /// queued item is the partner's server status.
    fn start(&mut self, partner: Arc<dyn Connector>, with_status_read: bool) -> bool;

    fn status(&self) -> TransportStatus;

    /// Ask the worker to copy items with `lo <= relay_time <= hi` into `sink`.
    fn request_fetch(&mut self, sink: Arc<FetchSink>, lo: i64, hi: i64) -> bool;

    fn fetch_status(&self) -> FetchStatus;

    fn dequeue_item(&mut self) -> Option<RelayItem>;

    /// Soft stop: accept no new work, let the current operation finish.
    fn shutdown(&mut self);

    /// Hard stop, used when the process is going down.
    fn terminate(&mut self);
}
