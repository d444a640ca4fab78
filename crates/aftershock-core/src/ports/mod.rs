//! Ports - 抽象化レイヤー
//!
//! Each trait here is a seam to something outside the scheduling core: the
//! task queue and relay log in the shared database, the transport worker that
//! talks to the partner server, the clock, and the task layer's reaction to
//! role changes. `impls` holds in-memory versions of all of them.

pub mod clock;
pub mod database;
pub mod id_generator;
pub mod relay_store;
pub mod relay_transport;
pub mod role_listener;
pub mod task_queue;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::database::{ConnectError, Connector, DbHandle};
pub use self::id_generator::{KeyGenerator, UlidKeyGenerator};
pub use self::relay_store::{MergeAction, RelayAuditEntry, RelayStore, RelayStoreError};
pub use self::relay_transport::{
    CallFailure, FetchSink, FetchStatus, RelayTransport, TransportStatus,
};
pub use self::role_listener::{NoopRoleListener, RoleListener};
pub use self::task_queue::{QueueError, QueueTransaction, TaskQueue};
