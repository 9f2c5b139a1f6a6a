//! Coordinate conversion between the model's normalized `[0, 1000]` space
//! and screen pixels.
//!
//! Pure functions; the only state is the screen resolution and optional
//! calibration offsets passed in by the caller. `(0, 0)` maps to the
//! top-left pixel and `(1000, 1000)` to `(W-1, H-1)`.

use iris_types::{ActionKind, NormPoint, NORMALIZED_MAX};

use crate::actuator::PixelAction;

/// Calibration offsets added after normalized-to-pixel conversion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Calibration {
    pub offset_x: i32,
    pub offset_y: i32,
}

/// Convert a normalized point to clamped screen pixels.
pub fn to_pixels(p: NormPoint, width: u32, height: u32, cal: Calibration) -> (u32, u32) {
    let px = (p.x / NORMALIZED_MAX * width as f64).round() as i64 + cal.offset_x as i64;
    let py = (p.y / NORMALIZED_MAX * height as f64).round() as i64 + cal.offset_y as i64;
    clamp_to_screen(px, py, width, height)
}

/// Clamp pixel coordinates into `[0, W-1] x [0, H-1]`.
pub fn clamp_to_screen(x: i64, y: i64, width: u32, height: u32) -> (u32, u32) {
    let cx = x.clamp(0, width.saturating_sub(1) as i64) as u32;
    let cy = y.clamp(0, height.saturating_sub(1) as i64) as u32;
    (cx, cy)
}

/// Inverse mapping, for calibration tooling and round-trip tests.
pub fn pixels_to_normalized(x: u32, y: u32, width: u32, height: u32) -> NormPoint {
    NormPoint::new(
        x as f64 / width as f64 * NORMALIZED_MAX,
        y as f64 / height as f64 * NORMALIZED_MAX,
    )
}

/// Translate an action kind into the pixel-space record the actuator takes.
///
/// Returns `None` for `DONE`/`FAIL` (nothing to execute). The second tuple
/// element reports whether any normalized coordinate had to be clamped into
/// `[0, 1000]` first; callers emit a warning when it is set.
pub fn resolve(
    kind: &ActionKind,
    width: u32,
    height: u32,
    cal: Calibration,
) -> Option<(PixelAction, bool)> {
    let mut clamped = false;
    let mut point = |p: NormPoint| {
        if !p.in_range() {
            clamped = true;
        }
        to_pixels(p.clamped(), width, height, cal)
    };

    let action = match kind {
        ActionKind::Click { target } => {
            let (x, y) = point(*target);
            PixelAction::Click { x, y }
        }
        ActionKind::DoubleClick { target } => {
            let (x, y) = point(*target);
            PixelAction::DoubleClick { x, y }
        }
        ActionKind::RightClick { target } => {
            let (x, y) = point(*target);
            PixelAction::RightClick { x, y }
        }
        ActionKind::Move { target } => {
            let (x, y) = point(*target);
            PixelAction::Move { x, y }
        }
        ActionKind::Drag {
            target,
            end,
            duration_ms,
        } => {
            let (x, y) = point(*target);
            let (end_x, end_y) = point(*end);
            PixelAction::Drag {
                x,
                y,
                end_x,
                end_y,
                duration_ms: *duration_ms,
            }
        }
        ActionKind::Type { text, target } => PixelAction::Type {
            text: text.clone(),
            at: target.map(&mut point),
        },
        ActionKind::Scroll { amount, target } => PixelAction::Scroll {
            amount: *amount,
            at: target.map(&mut point),
        },
        ActionKind::Key { keys } => PixelAction::Key { keys: keys.clone() },
        ActionKind::Wait { duration_ms } => PixelAction::Wait {
            duration_ms: *duration_ms,
        },
        ActionKind::Done | ActionKind::Fail => return None,
    };
    Some((action, clamped))
}
