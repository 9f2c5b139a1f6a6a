//! Action envelopes: the structured GUI action extracted from each VLM turn.
//!
//! [`ActionKind`] is a tagged enum whose variants carry exactly the fields
//! they need, so "pointer actions require a target" and "TYPE requires text"
//! hold by construction rather than by runtime checks over a bag of optional
//! fields. [`ActionEnvelope::validate`] covers what the type system cannot:
//! coordinate ranges, the confidence interval, and non-empty chord lists.

use serde::{Deserialize, Serialize};

/// Upper bound of the model's normalized coordinate space (inclusive).
pub const NORMALIZED_MAX: f64 = 1000.0;

/// A point in the model's normalized `[0, 1000]²` coordinate space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormPoint {
    pub x: f64,
    pub y: f64,
}

impl NormPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Whether both components are within `[0, 1000]`.
    pub fn in_range(&self) -> bool {
        (0.0..=NORMALIZED_MAX).contains(&self.x) && (0.0..=NORMALIZED_MAX).contains(&self.y)
    }

    /// Clamp both components into `[0, 1000]`.
    pub fn clamped(self) -> Self {
        Self {
            x: self.x.clamp(0.0, NORMALIZED_MAX),
            y: self.y.clamp(0.0, NORMALIZED_MAX),
        }
    }
}

/// The kind of GUI action the model requested, with per-kind payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    /// Single left click at a normalized point.
    Click { target: NormPoint },
    /// Double left click (open items).
    DoubleClick { target: NormPoint },
    /// Right click (context menu).
    RightClick { target: NormPoint },
    /// Move the pointer without clicking.
    Move { target: NormPoint },
    /// Press-drag from `target` to `end`.
    Drag {
        target: NormPoint,
        end: NormPoint,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    /// Type text, optionally clicking a field first.
    Type {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<NormPoint>,
    },
    /// Scroll by `amount` notches (negative = down), optionally at a point.
    Scroll {
        amount: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<NormPoint>,
    },
    /// Press a key chord, e.g. `["ctrl", "c"]` or `["enter"]`.
    Key { keys: Vec<String> },
    /// Wait for the UI to settle.
    Wait { duration_ms: u64 },
    /// The model judges the task complete.
    Done,
    /// The model judges the task impossible.
    Fail,
}

impl ActionKind {
    /// Canonical wire name, matching the prompt catalog.
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Click { .. } => "CLICK",
            ActionKind::DoubleClick { .. } => "DOUBLE_CLICK",
            ActionKind::RightClick { .. } => "RIGHT_CLICK",
            ActionKind::Move { .. } => "MOVE",
            ActionKind::Drag { .. } => "DRAG",
            ActionKind::Type { .. } => "TYPE",
            ActionKind::Scroll { .. } => "SCROLL",
            ActionKind::Key { .. } => "KEY",
            ActionKind::Wait { .. } => "WAIT",
            ActionKind::Done => "DONE",
            ActionKind::Fail => "FAIL",
        }
    }

    /// Whether this kind ends the task (`DONE` or `FAIL`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionKind::Done | ActionKind::Fail)
    }

    /// The primary pointer target, if this kind has one.
    pub fn pointer_target(&self) -> Option<NormPoint> {
        match self {
            ActionKind::Click { target }
            | ActionKind::DoubleClick { target }
            | ActionKind::RightClick { target }
            | ActionKind::Move { target }
            | ActionKind::Drag { target, .. } => Some(*target),
            ActionKind::Type { target, .. } | ActionKind::Scroll { target, .. } => *target,
            _ => None,
        }
    }

    /// Every normalized point this action references (target and drag end).
    pub fn points(&self) -> Vec<NormPoint> {
        let mut pts = Vec::new();
        if let Some(t) = self.pointer_target() {
            pts.push(t);
        }
        if let ActionKind::Drag { end, .. } = self {
            pts.push(*end);
        }
        pts
    }
}

/// The full action record extracted from one VLM response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEnvelope {
    /// What to do, with its per-kind payload.
    #[serde(flatten)]
    pub kind: ActionKind,
    /// Human-readable description of the UI element being acted on.
    #[serde(default)]
    pub target_description: String,
    /// Model confidence in `[0, 1]`. Actions below the safety threshold
    /// are rejected without execution.
    pub confidence: f64,
    /// The model's stated reason for this action.
    #[serde(default)]
    pub rationale: String,
}

impl ActionEnvelope {
    /// Check the invariants the type system cannot enforce.
    ///
    /// Returns the first violated invariant as an error string. Coordinate
    /// range violations are NOT errors here -- out-of-range points are
    /// clamped with a warning by the normalizer.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            ));
        }
        match &self.kind {
            ActionKind::Key { keys } if keys.is_empty() => {
                Err("KEY action with empty chord list".into())
            }
            ActionKind::Key { keys } if keys.iter().any(|k| k.trim().is_empty()) => {
                Err("KEY action with blank chord token".into())
            }
            ActionKind::Done | ActionKind::Fail if self.rationale.trim().is_empty() => {
                Err(format!("{} requires a rationale", self.kind.name()))
            }
            _ => Ok(()),
        }
    }

    /// Whether every referenced point lies inside `[0, 1000]²`.
    pub fn coordinates_in_range(&self) -> bool {
        self.kind.points().iter().all(|p| p.in_range())
    }
}
