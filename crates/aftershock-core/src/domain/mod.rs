//! Domain model: tasks, result codes, relay items, server status and the
//! state enumerations shared by the dispatcher and the relay link.

pub mod ids;
pub mod relay_item;
pub mod rescode;
pub mod server_status;
pub mod state;
pub mod task;

pub use ids::RecordKey;
pub use relay_item::{RelayId, RelayIdError, RelayItem, RelayItemKind};
pub use rescode::Rescode;
pub use server_status::{
    PROTOCOL_VERSION, RelayConfig, STATUS_SCHEMA_VERSION, ServerStatus, StatusFormatError, health,
};
pub use state::{DispatcherState, InferredState, LinkState, PrimaryState, RelayMode, UnknownCode};
pub use task::{
    LogEntry, NewTask, Opcode, SCHED_TIME_EARLY_LIMIT, SCHED_TIME_PROMPT_MIN, SCHED_TIME_SHUTDOWN,
    Task, TaskFilter,
};
