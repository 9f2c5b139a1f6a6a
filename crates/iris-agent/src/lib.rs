//! The Iris perception-action engine.
//!
//! Hosts the control loop ([`Orchestrator`]) and its seams: the
//! [`Actuator`] trait realized by platform input drivers, the [`VlmLink`]
//! trait realized by the VLM lifecycle manager, the coordinate normalizer,
//! the envelope parser, and the session/conversation state.

pub mod actuator;
pub mod coords;
pub mod orchestrator;
pub mod parse;
pub mod prompt;
pub mod session;

pub use actuator::{Actuator, NullActuator, PixelAction};
pub use coords::{clamp_to_screen, pixels_to_normalized, resolve, to_pixels, Calibration};
pub use orchestrator::{Orchestrator, OrchestratorHandle, VlmLink};
pub use parse::{display_thought, parse, serialize};
pub use prompt::{parse_intent, ChatIntent, INTENT_PROMPT, SYSTEM_PROMPT};
pub use session::{
    ActionHistory, ActionOutcome, ActionRecord, ConversationHistory, PROMPT_TURNS,
};
