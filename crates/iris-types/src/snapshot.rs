//! Observer-facing state: agent status, VLM status, and the coalesced
//! snapshot served by `GET /state` and pushed over the socket.

use serde::{Deserialize, Serialize};

/// What the agent is doing right now.
///
/// Wire names are a deliberate mix of cases: phase names are upper-case
/// (matching the overlay UI's conventions), while the two passive states
/// `idle` and `blocked` are lower-case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AgentStatus {
    #[default]
    #[serde(rename = "idle")]
    Idle,
    #[serde(rename = "THINKING")]
    Thinking,
    #[serde(rename = "CAPTURING")]
    Capturing,
    #[serde(rename = "EXECUTING")]
    Executing,
    #[serde(rename = "VERIFYING")]
    Verifying,
    #[serde(rename = "PAUSED")]
    Paused,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "ABORTED")]
    Aborted,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "blocked")]
    Blocked,
}

impl AgentStatus {
    /// Whether this status ends a task (observers show it briefly, then the
    /// snapshot returns to `idle`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Done | AgentStatus::Aborted | AgentStatus::Error)
    }
}

/// State of the supervised VLM server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VlmStatus {
    #[default]
    Offline,
    Starting,
    Ready,
    IdleHold,
    Stopping,
}

/// Voice pipeline state, mirrored from the external voice collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceState {
    #[default]
    Idle,
    Listening,
    Transcribing,
    Speaking,
}

/// The coalesced public view of the agent, read by `/state` and sent to new
/// socket subscribers on attach. All fields overwrite (latest value wins).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub status: AgentStatus,
    /// Human-readable detail for the current status, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// The most recent model thought shown to observers.
    #[serde(default)]
    pub last_thought: String,
    /// The action currently being executed, e.g. `"CLICK: Start button"`.
    #[serde(default)]
    pub current_action: String,
    pub vlm_status: VlmStatus,
    pub voice_state: VoiceState,
    /// Microphone level in `[0, 1]` for the overlay meter.
    #[serde(default)]
    pub voice_level: f32,
    /// PID of the agent worker, when one is running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}
