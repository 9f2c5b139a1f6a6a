//! Shared types for the Iris desktop agent.
//!
//! Everything crossing a crate boundary lives here: the tagged
//! [`ActionEnvelope`] the orchestrator extracts from model output, task and
//! status records, the event vocabulary of the bus, screen frames, the
//! configuration tree, and the [`IrisError`] taxonomy.

pub mod action;
pub mod config;
pub mod error;
pub mod event;
pub mod frame;
pub mod snapshot;
pub mod task;

pub use action::{ActionEnvelope, ActionKind, NormPoint, NORMALIZED_MAX};
pub use config::{
    ChatConfig, HeartbeatConfig, IrisConfig, LimitsConfig, ModelProfileConfig, SafetyConfig,
    ServerConfig, VlmConfig,
};
pub use error::IrisError;
pub use event::{ChatMessage, ChatRole, Event, EventPayload};
pub use frame::ScreenFrame;
pub use snapshot::{AgentSnapshot, AgentStatus, VlmStatus, VoiceState};
pub use task::{Task, TaskId, TaskState};
