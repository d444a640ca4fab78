use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::RecordKey;
use super::rescode::Rescode;

/// Scheduled times in `[SCHED_TIME_PROMPT_MIN, SCHED_TIME_EARLY_LIMIT]` are "early":
/// such tasks sort ahead of everything real-time and are exempt from idle forcing.
pub const SCHED_TIME_PROMPT_MIN: i64 = 10_000;

/// Scheduled time used for shutdown requests.
pub const SCHED_TIME_SHUTDOWN: i64 = 20_000;

/// Upper bound (inclusive) of the early range.
pub const SCHED_TIME_EARLY_LIMIT: i64 = 100_000;

/// Selects the handler for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Opcode(pub u16);

impl Opcode {
    pub const UNKNOWN: Opcode = Opcode(0);
    pub const NO_OP: Opcode = Opcode(1);
    pub const SHUTDOWN: Opcode = Opcode(2);
    pub const SET_RELAY_MODE: Opcode = Opcode(3);
    pub const SET_HEALTH: Opcode = Opcode(4);
    pub const GEN_TIMELINE: Opcode = Opcode(10);
    pub const GEN_PDL_REPORT: Opcode = Opcode(11);
    pub const ANNOUNCE_PRIMARY: Opcode = Opcode(12);
    pub const ANNOUNCE_SECONDARY: Opcode = Opcode(13);

    /// Opcodes the dispatcher executes itself.
    pub const BUILTINS: [Opcode; 4] = [
        Opcode::NO_OP,
        Opcode::SHUTDOWN,
        Opcode::SET_RELAY_MODE,
        Opcode::SET_HEALTH,
    ];

    pub fn is_builtin(self) -> bool {
        Self::BUILTINS.contains(&self)
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::NO_OP => "no_op",
            Opcode::SHUTDOWN => "shutdown",
            Opcode::SET_RELAY_MODE => "set_relay_mode",
            Opcode::SET_HEALTH => "set_health",
            Opcode::GEN_TIMELINE => "gen_timeline",
            Opcode::GEN_PDL_REPORT => "gen_pdl_report",
            Opcode::ANNOUNCE_PRIMARY => "announce_primary",
            Opcode::ANNOUNCE_SECONDARY => "announce_secondary",
            _ => "unknown",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// A pending task as seen by the dispatcher and handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub key: RecordKey,
    /// Grouping key, usually the earthquake event the task belongs to.
    pub event_id: String,
    /// Earliest execution time (effective clock, ms).
    pub sched_time: i64,
    pub submit_time: i64,
    pub submit_id: String,
    pub opcode: Opcode,
    /// Retry / sub-step counter.
    pub stage: i32,
    pub details: serde_json::Value,
    /// Effective time of the claim that activated this task.
    pub exec_time: Option<i64>,
    /// The task was activated before and that attempt never finished.
    #[serde(default)]
    pub restarted: bool,
}

impl Task {
    pub fn is_early(&self, early_limit: i64) -> bool {
        self.sched_time <= early_limit
    }
}

/// Input of `submit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub event_id: String,
    pub sched_time: i64,
    pub submit_time: i64,
    pub submit_id: String,
    pub opcode: Opcode,
    pub stage: i32,
    pub details: serde_json::Value,
}

impl NewTask {
    pub fn new(event_id: impl Into<String>, opcode: Opcode, sched_time: i64) -> Self {
        Self {
            event_id: event_id.into(),
            sched_time,
            submit_time: sched_time,
            submit_id: String::new(),
            opcode,
            stage: 0,
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_submit(mut self, submit_time: i64, submit_id: impl Into<String>) -> Self {
        self.submit_time = submit_time;
        self.submit_id = submit_id.into();
        self
    }

    pub fn with_stage(mut self, stage: i32) -> Self {
        self.stage = stage;
        self
    }

    pub fn into_task(self, key: RecordKey) -> Task {
        Task {
            key,
            event_id: self.event_id,
            sched_time: self.sched_time,
            submit_time: self.submit_time,
            submit_id: self.submit_id,
            opcode: self.opcode,
            stage: self.stage,
            details: self.details,
            exec_time: None,
            restarted: false,
        }
    }
}

/// Audit record written when a task completes through the default path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub key: RecordKey,
    pub event_id: String,
    pub opcode: Opcode,
    pub stage: i32,
    pub details: serde_json::Value,
    pub rescode: Rescode,
    pub remark: String,
    pub log_time: i64,
}

impl LogEntry {
    pub fn for_task(
        task: &Task,
        rescode: Rescode,
        remark: impl Into<String>,
        log_time: i64,
    ) -> Self {
        Self {
            key: task.key,
            event_id: task.event_id.clone(),
            opcode: task.opcode,
            stage: task.stage,
            details: task.details.clone(),
            rescode,
            remark: remark.into(),
            log_time,
        }
    }
}

/// Selects queued tasks for bulk cancellation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    /// Empty means any opcode.
    pub opcodes: Vec<Opcode>,
    pub event_id: Option<String>,
}

impl TaskFilter {
    pub fn opcodes(opcodes: impl IntoIterator<Item = Opcode>) -> Self {
        Self {
            opcodes: opcodes.into_iter().collect(),
            event_id: None,
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        (self.opcodes.is_empty() || self.opcodes.contains(&task.opcode))
            && self.event_id.as_ref().is_none_or(|e| *e == task.event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(opcode: Opcode, event_id: &str, sched_time: i64) -> Task {
        NewTask::new(event_id, opcode, sched_time).into_task(RecordKey::from_parts(1, 1))
    }

    #[test]
    fn early_range_is_inclusive() {
        assert!(task(Opcode::SHUTDOWN, "", SCHED_TIME_SHUTDOWN).is_early(SCHED_TIME_EARLY_LIMIT));
        assert!(task(Opcode::NO_OP, "", SCHED_TIME_EARLY_LIMIT).is_early(SCHED_TIME_EARLY_LIMIT));
        let late = task(Opcode::NO_OP, "", SCHED_TIME_EARLY_LIMIT + 1);
        assert!(!late.is_early(SCHED_TIME_EARLY_LIMIT));
    }

    #[test]
    fn filter_matches_opcode_and_event() {
        let t = task(Opcode::GEN_PDL_REPORT, "us7000abcd", 1_000_000);
        assert!(TaskFilter::default().matches(&t));
        assert!(TaskFilter::opcodes([Opcode::GEN_PDL_REPORT]).matches(&t));
        assert!(!TaskFilter::opcodes([Opcode::GEN_TIMELINE]).matches(&t));

        let mut by_event = TaskFilter::opcodes([]);
        by_event.event_id = Some("other".to_string());
        assert!(!by_event.matches(&t));
    }

    #[test]
    fn opcode_display_names_builtins() {
        assert_eq!(Opcode::SHUTDOWN.to_string(), "shutdown(2)");
        assert_eq!(Opcode(999).to_string(), "unknown(999)");
        assert!(Opcode::SET_HEALTH.is_builtin());
        assert!(!Opcode::GEN_TIMELINE.is_builtin());
    }
}
