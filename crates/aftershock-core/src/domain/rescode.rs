//! Result codes returned by opcode handlers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What the dispatcher does with a task after its handler returns.
///
/// - `Delete*`: remove the task, no audit record.
/// - `Stage*`: re-insert with the staging instructions the handler supplied.
/// - anything else: write an audit record keyed by the task, then remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Rescode {
    Delete,
    DeleteSuperseded,
    Stage,
    StageRetry,
    Success,
    Failure,
    TaskCorrupt,
    UnknownOpcode,
    Skipped,
}

impl Rescode {
    pub fn is_delete(self) -> bool {
        matches!(self, Rescode::Delete | Rescode::DeleteSuperseded)
    }

    pub fn is_stage(self) -> bool {
        matches!(self, Rescode::Stage | Rescode::StageRetry)
    }
}

impl fmt::Display for Rescode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
