//! Queue module: in-memory task queue, record bookkeeping and retry policies.

mod memory;
mod record;
mod retry;

pub use memory::InMemoryTaskQueue;
pub use record::{QueueRecord, TxId};
pub use retry::{CallRetryPolicy, RestartPolicy};
