//! Task records: one natural-language instruction driven to completion.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Strongly-typed task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of a task.
///
/// `Queued -> Running -> (Done | Aborted | Error)`. At most one task is
/// `Running` at any instant; submissions while running are refused with
/// `Busy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Queued,
    Running,
    Done,
    Aborted,
    Error,
}

impl TaskState {
    /// Whether the task has finished (successfully or not).
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Aborted | TaskState::Error)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Queued => "QUEUED",
            TaskState::Running => "RUNNING",
            TaskState::Done => "DONE",
            TaskState::Aborted => "ABORTED",
            TaskState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// A task being driven by the orchestrator.
///
/// The orchestrator owns the record for the task's lifetime; it is dropped
/// once a terminal state is reached (chat messages persist separately in the
/// session store).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// The user's natural-language instruction.
    pub command: String,
    pub created_at: DateTime<Utc>,
    pub state: TaskState,
    /// VLM calls consumed so far (bounded by the iteration cap).
    pub iterations_used: u32,
    /// Steer hints queued for injection into the next prompt, arrival order.
    #[serde(default)]
    pub steer_queue: Vec<String>,
}

impl Task {
    /// Create a freshly queued task for a command.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            command: command.into(),
            created_at: Utc::now(),
            state: TaskState::Queued,
            iterations_used: 0,
            steer_queue: Vec::new(),
        }
    }
}
