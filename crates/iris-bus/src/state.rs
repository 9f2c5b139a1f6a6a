//! Coalesced current-value state maintained alongside the fan-out queues.
//!
//! Observers that attach late (or poll over REST) do not replay history;
//! they read this cell: the latest [`AgentSnapshot`], the most recent frame,
//! and bounded histories of thoughts, actions, and chat messages.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use iris_types::{AgentSnapshot, AgentStatus, ChatMessage, Event, EventPayload, ScreenFrame};

/// Retained thought/action entries for `GET /chat/history`-adjacent views.
const HISTORY_CAPACITY: usize = 200;

/// Recent-activity entries exposed in the snapshot view.
const ACTIVITY_CAPACITY: usize = 30;

/// One entry in the recent-activity log.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityEntry {
    Thought(String),
    Action { action: String, description: String },
}

#[derive(Default)]
struct Inner {
    snapshot: AgentSnapshot,
    latest_frame: Option<Arc<ScreenFrame>>,
    thoughts: VecDeque<String>,
    actions: VecDeque<String>,
    chat: VecDeque<ChatMessage>,
    activity: VecDeque<ActivityEntry>,
    chat_capacity: usize,
}

/// Thread-safe coalesced state cell.
///
/// Writes happen on publish (the orchestrator's context or supervisor
/// ingress); reads are non-blocking snapshots from any context.
pub struct SnapshotCell {
    inner: RwLock<Inner>,
}

impl SnapshotCell {
    pub fn new(chat_capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                chat_capacity,
                ..Inner::default()
            }),
        }
    }

    /// Fold one event into the coalesced state.
    pub fn apply(&self, event: &Event) {
        let mut inner = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match &event.payload {
            EventPayload::Status {
                state,
                vlm_status,
                details,
            } => {
                if let Some(state) = state {
                    inner.snapshot.status = *state;
                    inner.snapshot.details = details.clone();
                }
                if let Some(vlm) = vlm_status {
                    inner.snapshot.vlm_status = *vlm;
                    if state.is_none() {
                        inner.snapshot.details = details.clone();
                    }
                }
            }
            EventPayload::Thought { text } => {
                inner.snapshot.last_thought = text.clone();
                push_bounded(&mut inner.thoughts, text.clone(), HISTORY_CAPACITY);
                push_bounded(
                    &mut inner.activity,
                    ActivityEntry::Thought(text.clone()),
                    ACTIVITY_CAPACITY,
                );
            }
            EventPayload::Action {
                action,
                description,
            } => {
                inner.snapshot.current_action = format!("{action}: {description}");
                push_bounded(
                    &mut inner.actions,
                    format!("{action}: {description}"),
                    HISTORY_CAPACITY,
                );
                push_bounded(
                    &mut inner.activity,
                    ActivityEntry::Action {
                        action: action.clone(),
                        description: description.clone(),
                    },
                    ACTIVITY_CAPACITY,
                );
            }
            EventPayload::Frame { frame } => {
                inner.latest_frame = Some(Arc::clone(frame));
            }
            EventPayload::VoiceState { state, .. } => {
                inner.snapshot.voice_state = *state;
            }
            EventPayload::VoiceLevel { level } => {
                inner.snapshot.voice_level = *level;
            }
            EventPayload::VoicePartial { .. } => {}
            EventPayload::ChatMessage(msg) => {
                let cap = inner.chat_capacity;
                push_bounded(&mut inner.chat, msg.clone(), cap);
            }
        }
    }

    /// Current snapshot (cheap clone).
    pub fn snapshot(&self) -> AgentSnapshot {
        self.read(|inner| inner.snapshot.clone())
    }

    /// The most recent frame, if any has been published.
    pub fn latest_frame(&self) -> Option<Arc<ScreenFrame>> {
        self.read(|inner| inner.latest_frame.clone())
    }

    /// Chat history, oldest first.
    pub fn chat_history(&self) -> Vec<ChatMessage> {
        self.read(|inner| inner.chat.iter().cloned().collect())
    }

    /// The recent-activity log (last 30 thoughts/actions), oldest first.
    pub fn recent_activity(&self) -> Vec<ActivityEntry> {
        self.read(|inner| inner.activity.iter().cloned().collect())
    }

    /// Drop all chat history (`clear_chat`).
    pub fn clear_chat(&self) {
        let mut inner = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.chat.clear();
    }

    /// Record the agent worker PID in the snapshot (supervisor-owned field).
    pub fn set_pid(&self, pid: Option<u32>) {
        let mut inner = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.snapshot.pid = pid;
    }

    /// Whether the snapshot currently shows a terminal status.
    pub fn status_is_terminal(&self) -> bool {
        self.read(|inner| inner.snapshot.status.is_terminal())
    }

    /// Reset the status to idle (the post-terminal dwell).
    pub fn reset_to_idle(&self) {
        let mut inner = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.snapshot.status = AgentStatus::Idle;
        inner.snapshot.details = None;
        inner.snapshot.current_action = String::new();
    }

    fn read<T>(&self, f: impl FnOnce(&Inner) -> T) -> T {
        match self.inner.read() {
            Ok(guard) => f(&guard),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }
}

fn push_bounded<T>(queue: &mut VecDeque<T>, value: T, capacity: usize) {
    if queue.len() >= capacity {
        queue.pop_front();
    }
    queue.push_back(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use iris_types::{VlmStatus, VoiceState};

    #[test]
    fn status_overwrites() {
        let cell = SnapshotCell::new(200);
        cell.apply(&Event::status(AgentStatus::Thinking, None));
        cell.apply(&Event::status(AgentStatus::Executing, Some("clicking".into())));
        let snap = cell.snapshot();
        assert_eq!(snap.status, AgentStatus::Executing);
        assert_eq!(snap.details.as_deref(), Some("clicking"));
    }

    #[test]
    fn vlm_status_rides_without_touching_agent_state() {
        let cell = SnapshotCell::new(200);
        cell.apply(&Event::status(AgentStatus::Thinking, None));
        cell.apply(&Event::vlm_status(VlmStatus::Offline, Some("crash".into())));
        let snap = cell.snapshot();
        assert_eq!(snap.status, AgentStatus::Thinking);
        assert_eq!(snap.vlm_status, VlmStatus::Offline);
        assert_eq!(snap.details.as_deref(), Some("crash"));
    }

    #[test]
    fn latest_frame_wins() {
        let cell = SnapshotCell::new(200);
        let a = Arc::new(ScreenFrame::new(10, 10, vec![1]));
        let b = Arc::new(ScreenFrame::new(10, 10, vec![2]));
        cell.apply(&Event::frame(Arc::clone(&a)));
        cell.apply(&Event::frame(Arc::clone(&b)));
        let latest = cell.latest_frame().unwrap();
        assert_eq!(latest.jpeg_bytes, vec![2]);
    }

    #[test]
    fn thought_history_is_bounded() {
        let cell = SnapshotCell::new(200);
        for i in 0..250 {
            cell.apply(&Event::thought(format!("t{i}")));
        }
        let snap = cell.snapshot();
        assert_eq!(snap.last_thought, "t249");
        // Activity log keeps only the last 30.
        let activity = cell.recent_activity();
        assert_eq!(activity.len(), 30);
        assert_eq!(activity[29], ActivityEntry::Thought("t249".into()));
    }

    #[test]
    fn chat_history_bounded_and_clearable() {
        let cell = SnapshotCell::new(3);
        for i in 0..5 {
            cell.apply(&Event::new(iris_types::EventPayload::ChatMessage(
                ChatMessage::user(format!("m{i}")),
            )));
        }
        let history = cell.chat_history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content, "m2");

        cell.clear_chat();
        assert!(cell.chat_history().is_empty());
    }

    #[test]
    fn voice_events_coalesce() {
        let cell = SnapshotCell::new(200);
        cell.apply(&Event::new(iris_types::EventPayload::VoiceLevel { level: 0.2 }));
        cell.apply(&Event::new(iris_types::EventPayload::VoiceLevel { level: 0.7 }));
        cell.apply(&Event::new(iris_types::EventPayload::VoiceState {
            state: VoiceState::Listening,
            partial: String::new(),
        }));
        let snap = cell.snapshot();
        assert_eq!(snap.voice_level, 0.7);
        assert_eq!(snap.voice_state, VoiceState::Listening);
    }

    #[test]
    fn reset_to_idle_clears_transients() {
        let cell = SnapshotCell::new(200);
        cell.apply(&Event::status(AgentStatus::Done, Some("task complete".into())));
        cell.apply(&Event::action("CLICK", "ok button"));
        assert!(cell.status_is_terminal());

        cell.reset_to_idle();
        let snap = cell.snapshot();
        assert_eq!(snap.status, AgentStatus::Idle);
        assert!(snap.details.is_none());
        assert!(snap.current_action.is_empty());
        // History survives the reset.
        assert!(!cell.recent_activity().is_empty());
    }
}
