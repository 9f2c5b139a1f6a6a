//! The actuator seam: screen capture and GUI input realization.
//!
//! Iris emits abstract pixel-space action records; an external collaborator
//! (platform input driver, remote desktop bridge, test double) realizes
//! them. Only the orchestrator's context ever calls an actuator, so
//! implementations need no internal ordering guarantees.

use async_trait::async_trait;

use iris_types::{IrisError, ScreenFrame};

/// A GUI action after normalized coordinates have been resolved to pixels.
///
/// Every coordinate is guaranteed to satisfy `0 <= x < W` and `0 <= y < H`
/// for the screen size the actuator reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PixelAction {
    Click { x: u32, y: u32 },
    DoubleClick { x: u32, y: u32 },
    RightClick { x: u32, y: u32 },
    Move { x: u32, y: u32 },
    Drag {
        x: u32,
        y: u32,
        end_x: u32,
        end_y: u32,
        duration_ms: Option<u64>,
    },
    Type {
        text: String,
        at: Option<(u32, u32)>,
    },
    Scroll {
        amount: i32,
        at: Option<(u32, u32)>,
    },
    Key { keys: Vec<String> },
    Wait { duration_ms: u64 },
}

impl PixelAction {
    /// The primary coordinates of this action, when it has any.
    pub fn position(&self) -> Option<(u32, u32)> {
        match self {
            PixelAction::Click { x, y }
            | PixelAction::DoubleClick { x, y }
            | PixelAction::RightClick { x, y }
            | PixelAction::Move { x, y }
            | PixelAction::Drag { x, y, .. } => Some((*x, *y)),
            PixelAction::Type { at, .. } | PixelAction::Scroll { at, .. } => *at,
            _ => None,
        }
    }
}

/// External collaborator that captures the screen and performs GUI events.
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Physical screen size in pixels, `(width, height)`.
    async fn screen_size(&self) -> Result<(u32, u32), IrisError>;

    /// Capture the current screen as a JPEG frame.
    async fn capture(&self) -> Result<ScreenFrame, IrisError>;

    /// Perform one GUI action.
    async fn apply(&self, action: &PixelAction) -> Result<(), IrisError>;

    /// Whether the operator's failsafe (pointer parked in a screen corner)
    /// is currently tripped. Tripping it aborts the running task.
    async fn failsafe_tripped(&self) -> bool {
        false
    }
}

/// Actuator that captures blank frames and swallows actions.
///
/// Lets the gateway run headless (demos, CI, development on machines
/// without an input driver). The reported screen is 1920x1080.
pub struct NullActuator;

#[async_trait]
impl Actuator for NullActuator {
    async fn screen_size(&self) -> Result<(u32, u32), IrisError> {
        Ok((1920, 1080))
    }

    async fn capture(&self) -> Result<ScreenFrame, IrisError> {
        Ok(ScreenFrame::new(1920, 1080, Vec::new()))
    }

    async fn apply(&self, _action: &PixelAction) -> Result<(), IrisError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_covers_pointer_actions() {
        assert_eq!(PixelAction::Click { x: 1, y: 2 }.position(), Some((1, 2)));
        assert_eq!(
            PixelAction::Drag {
                x: 3,
                y: 4,
                end_x: 5,
                end_y: 6,
                duration_ms: None
            }
            .position(),
            Some((3, 4))
        );
        assert_eq!(
            PixelAction::Type {
                text: "x".into(),
                at: None
            }
            .position(),
            None
        );
        assert_eq!(PixelAction::Wait { duration_ms: 10 }.position(), None);
    }

    #[tokio::test]
    async fn null_actuator_accepts_everything() {
        let actuator = NullActuator;
        assert_eq!(actuator.screen_size().await.unwrap(), (1920, 1080));
        let frame = actuator.capture().await.unwrap();
        assert_eq!(frame.width_px, 1920);
        assert!(actuator
            .apply(&PixelAction::Click { x: 10, y: 10 })
            .await
            .is_ok());
        assert!(!actuator.failsafe_tripped().await);
    }
}
