//! Per-session conversation history and action tracking.
//!
//! The conversation survives across tasks (until `clear_chat` or process
//! restart) and feeds the last K turns into each planning prompt. Action
//! records are per-task: they render into the prompt's recent-action list
//! and drive semantic loop detection.

use std::collections::VecDeque;

use iris_types::ChatRole;

/// Turns of context included in each planning prompt.
pub const PROMPT_TURNS: usize = 10;

/// Records kept per task for loop detection and prompt rendering.
const ACTION_HISTORY_CAPACITY: usize = 10;

/// Actions rendered into the prompt.
const ACTIONS_IN_PROMPT: usize = 5;

/// Bounded user/assistant conversation history.
pub struct ConversationHistory {
    turns: VecDeque<(ChatRole, String)>,
    capacity: usize,
}

impl ConversationHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            capacity: capacity.max(2),
        }
    }

    pub fn push(&mut self, role: ChatRole, text: impl Into<String>) {
        if self.turns.len() >= self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back((role, text.into()));
    }

    /// The last `PROMPT_TURNS` turns, oldest first.
    pub fn recent(&self) -> Vec<(ChatRole, String)> {
        self.turns
            .iter()
            .rev()
            .take(PROMPT_TURNS)
            .rev()
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// How an executed (or attempted) action ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Executed,
    Failed(String),
    Skipped,
}

/// One action for history tracking.
#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub action: String,
    pub target: String,
    pub position: Option<(u32, u32)>,
    pub outcome: ActionOutcome,
}

impl ActionRecord {
    fn render(&self) -> String {
        let coords = match self.position {
            Some((x, y)) => format!(" at ({x}, {y})"),
            None => String::new(),
        };
        let outcome = match &self.outcome {
            ActionOutcome::Executed => "executed".to_string(),
            ActionOutcome::Failed(reason) => format!("failed: {reason}"),
            ActionOutcome::Skipped => "skipped".to_string(),
        };
        format!("{}: {}{coords} -> {outcome}", self.action, self.target)
    }
}

/// Bounded per-task action history with repetition detection.
#[derive(Default)]
pub struct ActionHistory {
    records: VecDeque<ActionRecord>,
}

impl ActionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: ActionRecord) {
        if self.records.len() >= ACTION_HISTORY_CAPACITY {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    /// How many times the tail of the history repeats `(action, target)`,
    /// including the pending occurrence. `1` means no repetition yet.
    pub fn repeat_count(&self, action: &str, target: &str) -> u32 {
        let mut count = 1;
        for record in self.records.iter().rev() {
            if record.action == action && record.target == target {
                count += 1;
            } else {
                break;
            }
        }
        count
    }

    /// Render the most recent actions for the planning prompt.
    pub fn render_for_prompt(&self) -> String {
        self.records
            .iter()
            .rev()
            .take(ACTIONS_IN_PROMPT)
            .rev()
            .map(|r| format!("- {}", r.render()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
