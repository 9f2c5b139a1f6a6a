//! Prompt assembly for the control loop and the chat intent gate.

use iris_types::IrisError;

/// System persona for the perception-action loop.
///
/// Documents the normalized coordinate space and the exact envelope
/// serialization the parser pins (see `parse`).
pub const SYSTEM_PROMPT: &str = r#"You are a computer control agent. You see screenshots and control the desktop precisely.

## COORDINATE SYSTEM
Coordinates use the [0-1000] range:
- (0, 0) = top-left
- (1000, 1000) = bottom-right
- (500, 500) = center

## ACTIONS

CLICK - click an element
{"action": "CLICK", "target": "element", "coordinates": {"x": 500, "y": 300}, "confidence": 0.9, "task_complete": false}

DOUBLE_CLICK - open items
{"action": "DOUBLE_CLICK", "target": "element", "coordinates": {"x": 500, "y": 300}, "confidence": 0.9, "task_complete": false}

RIGHT_CLICK - context menu
{"action": "RIGHT_CLICK", "target": "element", "coordinates": {"x": 500, "y": 300}, "confidence": 0.9, "task_complete": false}

TYPE - type text
{"action": "TYPE", "target": "field", "text": "text to type", "coordinates": {"x": 500, "y": 300}, "confidence": 0.9, "task_complete": false}

KEY - press a key or chord
{"action": "KEY", "keys": ["ctrl", "c"], "confidence": 0.9, "task_complete": false}

SCROLL - scroll (negative = down)
{"action": "SCROLL", "scroll": -3, "coordinates": {"x": 500, "y": 500}, "confidence": 0.9, "task_complete": false}

DRAG - press and drag
{"action": "DRAG", "coordinates": {"x": 200, "y": 200}, "end_coordinates": {"x": 600, "y": 200}, "confidence": 0.9, "task_complete": false}

WAIT - wait for loading
{"action": "WAIT", "duration_ms": 2000, "confidence": 1.0, "task_complete": false}

FAIL - the task cannot be completed
{"action": "FAIL", "rationale": "why it is impossible", "confidence": 1.0, "task_complete": false}

## RULES

1. LOOK then ACT - briefly check the screen, then act. Do not over-analyze.
2. COMPLETE THE TASK - when you can SEE the expected result, set "task_complete": true with a rationale.
3. NEVER REPEAT - if an action did not work, try something different: other coordinates, another action type, the keyboard instead of the mouse.
4. POPUPS FIRST - handle dialogs before the main task.
5. ONE ACTION PER TURN - reply with exactly one json block."#;

/// Build the per-iteration planning prompt.
///
/// `context` carries screen size, step counter, steering hints, and any
/// carried-forward error; `action_history` is the rendered recent-action
/// list used to break repetition loops.
pub fn plan_prompt(task: &str, context: &str, action_history: &str) -> String {
    let history_section = if action_history.is_empty() {
        String::new()
    } else {
        format!(
            "\n## RECENT ACTIONS\n{action_history}\nIf the same action appears multiple times it is NOT working. Try something different.\n"
        )
    };

    format!(
        r#"TASK: {task}

{context}
{history_section}
---

Look at the screenshot. What do you see and what is the next step?

<observation>
Briefly describe: what window is active? What elements are visible for this task?
</observation>

<reasoning>
1. Is the task already complete? (Can I see the expected result?)
2. If not, what ONE action should I take?
3. What are the coordinates of my target?
</reasoning>

```json
{{
  "action": "ACTION",
  "target": "element",
  "coordinates": {{"x": 0, "y": 0}},
  "confidence": 0.0,
  "task_complete": false
}}
```

IMPORTANT: set "task_complete": true as soon as you can SEE the task is done."#
    )
}

/// Hint injected after the same action repeated without progress.
pub fn recovery_hint(failed_action: &str, attempts: u32) -> String {
    format!(
        "'{failed_action}' has been tried {attempts} times without success. \
         This approach is NOT working. Do something completely different: \
         another element, another action type, a keyboard shortcut, or \
         scrolling to reveal hidden elements. Do NOT repeat the same action."
    )
}

/// One-line time context so heartbeat-driven tasks know the hour.
pub fn time_of_day_context(hour: u8) -> String {
    let part = match hour {
        5..=11 => "morning",
        12..=16 => "afternoon",
        17..=21 => "evening",
        _ => "night",
    };
    format!("Current time: {hour:02}:00 ({part})")
}

// ---------------------------------------------------------------------------
// Chat intent gate
// ---------------------------------------------------------------------------

/// System prompt for classifying an incoming chat message.
pub const INTENT_PROMPT: &str = r#"You are a personal desktop assistant. Classify the user's message before responding.

OUTPUT FORMAT (exactly one json object):
{"mode": "chat|task|screen", "reply": "your short response", "task": "concrete description when mode=task"}

MODES:
- chat: conversation, questions, general talk. Reply directly, do not touch the computer.
- task: the user wants you to DO something on their computer.
- screen: the user wants you to look at or describe their screen.

Keep replies brief and natural."#;

/// Outcome of the chat intent gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatIntent {
    /// Conversational only; reply without spawning a task.
    Chat { reply: String },
    /// Actionable: spawn a task with this command.
    Task { reply: String, command: String },
    /// Look at the screen and describe it.
    Screen { reply: String },
}

/// Parse the intent gate's JSON reply.
pub fn parse_intent(raw: &str) -> Result<ChatIntent, IrisError> {
    let (start, end) = match (raw.find('{'), raw.rfind('}')) {
        (Some(s), Some(e)) if s < e => (s, e),
        _ => return Err(IrisError::Parse("no intent object in reply".into())),
    };
    let value: serde_json::Value = serde_json::from_str(&raw[start..=end])
        .map_err(|e| IrisError::Parse(format!("bad intent json: {e}")))?;

    let reply = value["reply"].as_str().unwrap_or_default().to_string();
    match value["mode"].as_str() {
        Some("chat") => Ok(ChatIntent::Chat { reply }),
        Some("task") => {
            let command = value["task"]
                .as_str()
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| IrisError::Parse("task mode without task text".into()))?
                .to_string();
            Ok(ChatIntent::Task { reply, command })
        }
        Some("screen") => Ok(ChatIntent::Screen { reply }),
        other => Err(IrisError::Parse(format!("unknown intent mode {other:?}"))),
    }
}
