//! Typed events flowing through the in-process bus to observers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::frame::ScreenFrame;
use crate::snapshot::{AgentStatus, VlmStatus, VoiceState};

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

/// A chat message in the session history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }
}

/// An event published by the orchestrator, lifecycle manager, or supervisor.
///
/// The wire shape is `{kind, at, payload}`. Within one subscriber events are
/// FIFO in publication order; across subscribers there is no ordering
/// promise, and slow subscribers lose oldest events rather than blocking
/// publishers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    /// Agent status transition. Coalesced: latest value wins. Lifecycle
    /// transitions of the VLM process ride along in `vlm_status` without
    /// touching the agent state.
    Status {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<AgentStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        vlm_status: Option<VlmStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
    /// A model thought/observation for the overlay. Appended to history.
    Thought { text: String },
    /// An action about to be executed. Appended to history.
    Action {
        /// Canonical action name (`CLICK`, `TYPE`, ...).
        action: String,
        /// Target element description.
        description: String,
    },
    /// A captured frame. Coalesced: only the latest frame is retained.
    Frame { frame: Arc<ScreenFrame> },
    /// Voice pipeline state. Coalesced.
    VoiceState {
        state: VoiceState,
        #[serde(default)]
        partial: String,
    },
    /// Partial transcription while the user is speaking.
    VoicePartial { text: String },
    /// Microphone level for the overlay meter. Coalesced.
    VoiceLevel { level: f32 },
    /// A chat message (user, assistant, or system). Appended to history.
    ChatMessage(ChatMessage),
}

/// Envelope carrying a payload plus its publication timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            at: Utc::now(),
            payload,
        }
    }

    /// Shorthand for an agent status event.
    pub fn status(state: AgentStatus, details: Option<String>) -> Self {
        Self::new(EventPayload::Status {
            state: Some(state),
            vlm_status: None,
            details,
        })
    }

    /// Shorthand for a VLM lifecycle status event.
    pub fn vlm_status(vlm_status: VlmStatus, details: Option<String>) -> Self {
        Self::new(EventPayload::Status {
            state: None,
            vlm_status: Some(vlm_status),
            details,
        })
    }

    /// Shorthand for a thought event.
    pub fn thought(text: impl Into<String>) -> Self {
        Self::new(EventPayload::Thought { text: text.into() })
    }

    /// Shorthand for an action event.
    pub fn action(action: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(EventPayload::Action {
            action: action.into(),
            description: description.into(),
        })
    }

    /// Shorthand for a frame event.
    pub fn frame(frame: Arc<ScreenFrame>) -> Self {
        Self::new(EventPayload::Frame { frame })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_wire_shape() {
        let ev = Event::status(AgentStatus::Thinking, Some("step 3".into()));
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["kind"], "status");
        assert_eq!(json["payload"]["state"], "THINKING");
        assert_eq!(json["payload"]["details"], "step 3");
        assert!(json["payload"].get("vlm_status").is_none());
        assert!(json["at"].is_string());
    }

    #[test]
    fn vlm_status_event_omits_agent_state() {
        let ev = Event::vlm_status(crate::VlmStatus::Offline, Some("crash".into()));
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["kind"], "status");
        assert_eq!(json["payload"]["vlm_status"], "OFFLINE");
        assert!(json["payload"].get("state").is_none());
    }

    #[test]
    fn chat_message_event_roundtrip() {
        let ev = Event::new(EventPayload::ChatMessage(ChatMessage::user("hello")));
        let json = serde_json::to_string(&ev).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        match back.payload {
            EventPayload::ChatMessage(msg) => {
                assert_eq!(msg.role, ChatRole::User);
                assert_eq!(msg.content, "hello");
            }
            other => panic!("expected chat message, got {other:?}"),
        }
    }

    #[test]
    fn frame_event_serializes_base64() {
        let frame = Arc::new(ScreenFrame::new(10, 10, vec![9, 9, 9]));
        let ev = Event::frame(frame);
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["kind"], "frame");
        assert!(json["payload"]["frame"]["image_base64"].is_string());
    }

    #[test]
    fn chat_roles_lowercase_on_wire() {
        assert_eq!(serde_json::to_string(&ChatRole::Assistant).unwrap(), "\"assistant\"");
    }
}
