//! ChannelRelayTransport - tokio タスクによるリレー転送ワーカー
//!
//! # 実装詳細
//! - ワーカーは `tokio::spawn` されたタスクで、相手のデータベースに接続する
//! - 受信アイテムは bounded `mpsc` で渡す（満杯ならワーカー側が待つ）
//! - 状態は `watch` で公開し、リンク側はロックなしで読む
//! - `shutdown` は停止フラグ、`terminate` は `abort`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::RelayItem;
use crate::ports::{CallFailure, Connector, FetchSink, FetchStatus, RelayTransport, TransportStatus};

struct FetchRequest {
    sink: Arc<FetchSink>,
    lo: i64,
    hi: i64,
}

/// One started worker and the link-side ends of its channels.
struct Session {
    items: mpsc::Receiver<RelayItem>,
    status: watch::Receiver<TransportStatus>,
    fetch: Arc<watch::Sender<FetchStatus>>,
    requests: mpsc::Sender<FetchRequest>,
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

pub struct ChannelRelayTransport {
    capacity: usize,
    poll_interval: Duration,
    session: Option<Session>,
    /// Reported while no session exists.
    idle_status: TransportStatus,
}

impl ChannelRelayTransport {
    pub fn new(capacity: usize, poll_interval: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            poll_interval,
            session: None,
            idle_status: TransportStatus::Idle,
        }
    }

    fn stop_session(&mut self, abort: bool) {
        if let Some(session) = self.session.take() {
            session.stop.store(true, Ordering::SeqCst);
            if abort {
                session.task.abort();
            }
            self.idle_status = TransportStatus::Stopped;
        }
    }
}

impl RelayTransport for ChannelRelayTransport {
    fn start(&mut self, partner: Arc<dyn Connector>, with_status_read: bool) -> bool {
        self.stop_session(false);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("relay transport started outside a tokio runtime");
            return false;
        };

        let (items_tx, items_rx) = mpsc::channel(self.capacity);
        let (status_tx, status_rx) = watch::channel(TransportStatus::Starting);
        let (requests_tx, requests_rx) = mpsc::channel(1);
        let fetch = Arc::new(watch::Sender::new(FetchStatus::Idle));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            partner,
            with_status_read,
            capacity: self.capacity,
            poll_interval: self.poll_interval,
            items: items_tx,
            status: status_tx,
            fetch: Arc::clone(&fetch),
            requests: requests_rx,
            stop: Arc::clone(&stop),
        };
        let task = runtime.spawn(worker.run());

        self.session = Some(Session {
            items: items_rx,
            status: status_rx,
            fetch,
            requests: requests_tx,
            stop,
            task,
        });
        true
    }

    fn status(&self) -> TransportStatus {
        match &self.session {
            Some(session) => *session.status.borrow(),
            None => self.idle_status,
        }
    }

    fn request_fetch(&mut self, sink: Arc<FetchSink>, lo: i64, hi: i64) -> bool {
        let Some(session) = &self.session else {
            return false;
        };
        // Active goes out first: the worker may finish before try_send returns.
        let previous = session.fetch.send_replace(FetchStatus::Active);
        if session.requests.try_send(FetchRequest { sink, lo, hi }).is_err() {
            session.fetch.send_replace(previous);
            return false;
        }
        true
    }

    fn fetch_status(&self) -> FetchStatus {
        match &self.session {
            Some(session) => *session.fetch.borrow(),
            None => FetchStatus::Idle,
        }
    }

    fn dequeue_item(&mut self) -> Option<RelayItem> {
        self.session.as_mut()?.items.try_recv().ok()
    }

    fn shutdown(&mut self) {
        self.stop_session(false);
    }

    fn terminate(&mut self) {
        self.stop_session(true);
    }
}

impl Drop for ChannelRelayTransport {
    fn drop(&mut self) {
        self.stop_session(true);
    }
}

struct Worker {
    partner: Arc<dyn Connector>,
    with_status_read: bool,
    capacity: usize,
    poll_interval: Duration,
    items: mpsc::Sender<RelayItem>,
    status: watch::Sender<TransportStatus>,
    fetch: Arc<watch::Sender<FetchStatus>>,
    requests: mpsc::Receiver<FetchRequest>,
    stop: Arc<AtomicBool>,
}

impl Worker {
    async fn run(mut self) {
        let outcome = self.session().await;
        let final_status = match outcome {
            Ok(()) => TransportStatus::Stopped,
            Err(reason) => TransportStatus::Failed(reason),
        };
        debug!(
            partner = self.partner.server_number(),
            ?final_status,
            "relay transport worker exiting"
        );
        self.status.send_replace(final_status);
    }

    async fn session(&mut self) -> Result<(), CallFailure> {
        let partner_number = self.partner.server_number();
        let db = self.partner.connect().await.map_err(|e| {
            warn!(partner = partner_number, error = %e, "relay call failed");
            CallFailure::Unreachable
        })?;

        let mut seq = db.relay.head_seq().await.map_err(|_| CallFailure::Unreachable)?;

        if self.with_status_read {
            let status = db
                .relay
                .get_status(partner_number)
                .await
                .map_err(|_| CallFailure::Unreachable)?
                .ok_or(CallFailure::BadState)?;
            if self.items.send(status).await.is_err() {
                return Ok(());
            }
        }
        self.status.send_replace(TransportStatus::Running);

        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(());
            }

            match self.requests.try_recv() {
                Ok(req) => match db.relay.query_range(req.lo, req.hi).await {
                    Ok(items) => {
                        let count = items.len();
                        let chunk_len = self.capacity.min(req.sink.limit());
                        let pause = self.poll_interval;
                        if !fill(&req.sink, items, chunk_len, pause, &self.stop).await {
                            return Ok(());
                        }
                        debug!(partner = partner_number, count, "relay fetch finished");
                        self.fetch.send_replace(FetchStatus::Finished);
                    }
                    Err(e) => {
                        warn!(partner = partner_number, error = %e, "relay fetch failed");
                        self.fetch.send_replace(FetchStatus::Failed);
                    }
                },
                Err(mpsc::error::TryRecvError::Empty) => {}
                Err(mpsc::error::TryRecvError::Disconnected) => return Ok(()),
            }

            let (batch, next) = db
                .relay
                .changes_since(seq, self.capacity)
                .await
                .map_err(|_| CallFailure::Unreachable)?;
            for item in batch {
                if self.items.send(item).await.is_err() {
                    return Ok(());
                }
            }
            seq = next;

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Hand fetched items to the sink a chunk at a time, waiting while the link
/// has not drained it. `false` if the worker was stopped meanwhile.
async fn fill(
    sink: &FetchSink,
    items: Vec<RelayItem>,
    chunk_len: usize,
    pause: Duration,
    stop: &AtomicBool,
) -> bool {
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        while sink.room() < chunk_len.min(items.len()) {
            if stop.load(Ordering::SeqCst) {
                return false;
            }
            tokio::time::sleep(pause).await;
        }
        sink.extend(items.by_ref().take(chunk_len));
    }
    true
}
