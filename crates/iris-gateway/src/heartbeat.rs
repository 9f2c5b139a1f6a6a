//! Proactive heartbeat: periodic wake-ups gated to active hours.
//!
//! Each due tick reads the checklist at `data/HEARTBEAT.md`; when it holds
//! unchecked items, a `chat_message` is synthesized so the assistant (and
//! remote observers) see the pending reminders. Quiet hours and an empty or
//! missing checklist produce nothing.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use iris_types::{ChatMessage, HeartbeatConfig};

/// Whether `hour` falls inside the active window `[start, end)`.
///
/// Windows that wrap midnight (`start > end`) are supported.
pub fn within_active_hours(hour: u8, start: u8, end: u8) -> bool {
    if start == end {
        return false;
    }
    if start < end {
        (start..end).contains(&hour)
    } else {
        hour >= start || hour < end
    }
}

/// Extract pending checklist items: `- [ ] something` lines.
pub fn pending_items(checklist: &str) -> Vec<String> {
    checklist
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            trimmed
                .strip_prefix("- [ ]")
                .map(|rest| rest.trim().to_string())
        })
        .filter(|item| !item.is_empty())
        .collect()
}

/// Interval-driven heartbeat scheduler.
pub struct Heartbeat {
    config: HeartbeatConfig,
    checklist_path: PathBuf,
    last_tick: Option<Instant>,
}

impl Heartbeat {
    pub fn new(config: HeartbeatConfig, checklist_path: PathBuf) -> Self {
        Self {
            config,
            checklist_path,
            last_tick: None,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.config.interval_minutes * 60)
    }

    /// Whether enough time has passed for the next wake-up.
    pub fn is_due(&self) -> bool {
        if !self.config.enabled {
            return false;
        }
        match self.last_tick {
            None => true,
            Some(last) => last.elapsed() >= self.interval(),
        }
    }

    /// Run one wake-up at local `hour`. Returns a synthesized message when
    /// the checklist warrants one, `None` otherwise.
    pub fn tick(&mut self, hour: u8) -> Option<ChatMessage> {
        if !self.config.enabled {
            return None;
        }
        self.last_tick = Some(Instant::now());

        if !within_active_hours(
            hour,
            self.config.active_hours_start,
            self.config.active_hours_end,
        ) {
            return None;
        }

        let checklist = std::fs::read_to_string(&self.checklist_path).ok()?;
        let items = pending_items(&checklist);
        if items.is_empty() {
            return None;
        }

        let preview = items
            .iter()
            .take(3)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("; ");
        Some(ChatMessage::system(format!(
            "Heartbeat: {} pending item(s) on the checklist: {preview}",
            items.len()
        )))
    }
}
