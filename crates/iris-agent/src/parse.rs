//! Extraction of action envelopes from free-form VLM output.
//!
//! The model is prompted to answer with `<observation>` / `<reasoning>`
//! commentary followed by a fenced ```json block holding the action. The
//! pinned serialization is:
//!
//! ```json
//! {
//!   "action": "CLICK",
//!   "target": "Start button",
//!   "coordinates": {"x": 500, "y": 300},
//!   "confidence": 0.92,
//!   "rationale": "the menu must be opened first",
//!   "task_complete": false
//! }
//! ```
//!
//! Per-kind fields: `text` (TYPE), `keys`/`key` (KEY, with `PRESS` and
//! `HOTKEY` accepted as aliases), `scroll` (SCROLL), `duration_ms` or
//! `duration` in seconds (WAIT), `end_coordinates` (DRAG).
//! `task_complete: true` means DONE regardless of the action field.
//!
//! When several envelopes appear in one response the last well-formed one
//! wins; when no fenced block parses, the first-`{`-to-last-`}` slice is
//! tried before giving up with a parse error.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use iris_types::{ActionEnvelope, ActionKind, IrisError, NormPoint};

/// Observation preview length in the thought feed.
const OBSERVATION_PREVIEW: usize = 150;

/// Reasoning preview length appended after the observation.
const REASONING_PREVIEW: usize = 100;

/// Fallback preview length when the model returned no tagged commentary.
const RAW_PREVIEW: usize = 200;

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```(?:json)?\s*\n?([\s\S]*?)\n?```").expect("fence regex"))
}

fn tag_re(tag: &str) -> Regex {
    Regex::new(&format!(r"(?s)<{tag}>(.*?)</{tag}>")).expect("tag regex")
}

/// Parse model output into an envelope.
pub fn parse(raw: &str) -> Result<ActionEnvelope, IrisError> {
    if raw.trim().is_empty() {
        return Err(IrisError::Parse("empty model response".into()));
    }

    let mut last_good: Option<ActionEnvelope> = None;
    for capture in fence_re().captures_iter(raw) {
        if let Ok(value) = serde_json::from_str::<Value>(capture[1].trim()) {
            if let Ok(env) = envelope_from_value(&value) {
                last_good = Some(env);
            }
        }
    }
    if let Some(env) = last_good {
        return Ok(env);
    }

    // Fallback: widest brace-delimited slice.
    if let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&raw[start..=end]) {
                return envelope_from_value(&value);
            }
        }
    }

    Err(IrisError::Parse("no well-formed action envelope".into()))
}

/// Interpret one JSON object as an envelope.
fn envelope_from_value(value: &Value) -> Result<ActionEnvelope, IrisError> {
    let obj = value
        .as_object()
        .ok_or_else(|| IrisError::Parse("envelope is not an object".into()))?;

    let confidence = obj.get("confidence").and_then(Value::as_f64).unwrap_or(1.0);
    let rationale = obj
        .get("rationale")
        .or_else(|| obj.get("thought"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let target_description = obj
        .get("target")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let task_complete = obj
        .get("task_complete")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let kind = if task_complete {
        ActionKind::Done
    } else {
        let action = obj
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| IrisError::Parse("missing action field".into()))?
            .to_ascii_uppercase();
        kind_from_fields(&action, obj)?
    };

    let envelope = ActionEnvelope {
        kind,
        target_description,
        confidence,
        rationale,
    };
    envelope.validate().map_err(IrisError::Parse)?;
    Ok(envelope)
}

fn kind_from_fields(
    action: &str,
    obj: &serde_json::Map<String, Value>,
) -> Result<ActionKind, IrisError> {
    let kind = match action {
        "CLICK" => ActionKind::Click {
            target: require_point(obj, "coordinates")?,
        },
        "DOUBLE_CLICK" => ActionKind::DoubleClick {
            target: require_point(obj, "coordinates")?,
        },
        "RIGHT_CLICK" => ActionKind::RightClick {
            target: require_point(obj, "coordinates")?,
        },
        "MOVE" => ActionKind::Move {
            target: require_point(obj, "coordinates")?,
        },
        "DRAG" => ActionKind::Drag {
            target: require_point(obj, "coordinates")?,
            end: require_point(obj, "end_coordinates")?,
            duration_ms: obj.get("duration_ms").and_then(Value::as_u64),
        },
        "TYPE" => ActionKind::Type {
            text: obj
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| IrisError::Parse("TYPE requires text".into()))?
                .to_string(),
            target: optional_point(obj, "coordinates"),
        },
        "SCROLL" => ActionKind::Scroll {
            amount: obj
                .get("scroll")
                .or_else(|| obj.get("amount"))
                .and_then(Value::as_i64)
                .ok_or_else(|| IrisError::Parse("SCROLL requires scroll amount".into()))?
                as i32,
            target: optional_point(obj, "coordinates"),
        },
        "KEY" | "HOTKEY" => ActionKind::Key {
            keys: keys_from(obj)?,
        },
        "PRESS" => ActionKind::Key {
            keys: vec![obj
                .get("key")
                .and_then(Value::as_str)
                .ok_or_else(|| IrisError::Parse("PRESS requires key".into()))?
                .to_string()],
        },
        "WAIT" => ActionKind::Wait {
            duration_ms: obj
                .get("duration_ms")
                .and_then(Value::as_u64)
                .or_else(|| {
                    obj.get("duration")
                        .and_then(Value::as_f64)
                        .map(|secs| (secs * 1000.0) as u64)
                })
                .unwrap_or(1000),
        },
        "DONE" => ActionKind::Done,
        "FAIL" => ActionKind::Fail,
        other => {
            return Err(IrisError::Parse(format!("unknown action {other:?}")));
        }
    };
    Ok(kind)
}

fn keys_from(obj: &serde_json::Map<String, Value>) -> Result<Vec<String>, IrisError> {
    if let Some(keys) = obj.get("keys").and_then(Value::as_array) {
        let keys: Vec<String> = keys
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        if !keys.is_empty() {
            return Ok(keys);
        }
    }
    if let Some(key) = obj.get("key").and_then(Value::as_str) {
        return Ok(vec![key.to_string()]);
    }
    Err(IrisError::Parse("KEY requires keys".into()))
}

fn require_point(
    obj: &serde_json::Map<String, Value>,
    field: &str,
) -> Result<NormPoint, IrisError> {
    optional_point(obj, field)
        .ok_or_else(|| IrisError::Parse(format!("pointer action requires {field}")))
}

fn optional_point(obj: &serde_json::Map<String, Value>, field: &str) -> Option<NormPoint> {
    let coords = obj.get(field)?;
    let x = coords.get("x").and_then(Value::as_f64)?;
    let y = coords.get("y").and_then(Value::as_f64)?;
    Some(NormPoint::new(x, y))
}

/// Emit the canonical serialization (`parse(serialize(e)) == e`).
pub fn serialize(envelope: &ActionEnvelope) -> String {
    let mut obj = serde_json::Map::new();
    obj.insert("action".into(), envelope.kind.name().into());
    if !envelope.target_description.is_empty() {
        obj.insert("target".into(), envelope.target_description.clone().into());
    }

    match &envelope.kind {
        ActionKind::Click { target }
        | ActionKind::DoubleClick { target }
        | ActionKind::RightClick { target }
        | ActionKind::Move { target } => {
            obj.insert("coordinates".into(), point_value(target));
        }
        ActionKind::Drag {
            target,
            end,
            duration_ms,
        } => {
            obj.insert("coordinates".into(), point_value(target));
            obj.insert("end_coordinates".into(), point_value(end));
            if let Some(ms) = duration_ms {
                obj.insert("duration_ms".into(), (*ms).into());
            }
        }
        ActionKind::Type { text, target } => {
            obj.insert("text".into(), text.clone().into());
            if let Some(target) = target {
                obj.insert("coordinates".into(), point_value(target));
            }
        }
        ActionKind::Scroll { amount, target } => {
            obj.insert("scroll".into(), (*amount).into());
            if let Some(target) = target {
                obj.insert("coordinates".into(), point_value(target));
            }
        }
        ActionKind::Key { keys } => {
            obj.insert(
                "keys".into(),
                Value::Array(keys.iter().map(|k| k.clone().into()).collect()),
            );
        }
        ActionKind::Wait { duration_ms } => {
            obj.insert("duration_ms".into(), (*duration_ms).into());
        }
        ActionKind::Done | ActionKind::Fail => {}
    }

    obj.insert("confidence".into(), envelope.confidence.into());
    if !envelope.rationale.is_empty() {
        obj.insert("rationale".into(), envelope.rationale.clone().into());
    }
    obj.insert(
        "task_complete".into(),
        matches!(envelope.kind, ActionKind::Done).into(),
    );

    let body = serde_json::to_string_pretty(&Value::Object(obj)).expect("serializable map");
    format!("```json\n{body}\n```")
}

fn point_value(p: &NormPoint) -> Value {
    serde_json::json!({"x": p.x, "y": p.y})
}

/// Build the observer-facing thought line from raw model output.
///
/// Prefers tagged `<observation>`/`<reasoning>` commentary; falls back to a
/// truncated view of the response with fenced blocks stripped. Returns
/// `None` when there is nothing presentable.
pub fn display_thought(raw: &str) -> Option<String> {
    let observation = tag_re("observation")
        .captures(raw)
        .map(|c| c[1].trim().to_string());
    let reasoning = tag_re("reasoning")
        .captures(raw)
        .map(|c| c[1].trim().to_string());

    let mut display = String::new();
    if let Some(obs) = observation {
        display.push_str(&truncate(&obs, OBSERVATION_PREVIEW));
    }
    if let Some(reason) = reasoning {
        if !display.is_empty() {
            display.push('\n');
        }
        display.push_str(&truncate(&reason, REASONING_PREVIEW));
    }

    if display.is_empty() {
        let stripped = fence_re().replace_all(raw, "");
        let stripped = stripped.trim();
        if stripped.is_empty() {
            return None;
        }
        display = truncate(stripped, RAW_PREVIEW);
    }
    Some(display)
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let cut: String = text.chars().take(limit).collect();
        format!("{cut}...")
    }
}
