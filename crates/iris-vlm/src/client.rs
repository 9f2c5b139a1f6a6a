//! HTTP client for the VLM server's OpenAI-compatible chat endpoint.
//!
//! The server is a local llama-server instance; this client owns the
//! `/health` probe and the `/v1/chat/completions` call with bounded retry.
//! Connection errors after the retry budget surface as
//! [`IrisError::VlmUnreachable`] so the lifecycle manager can treat them
//! as a crash signal; timeouts leave the process intact.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use iris_types::{ChatRole, IrisError};

/// Internal retries for transient connection failures.
const CHAT_RETRIES: u32 = 3;

/// Backoff between chat retries.
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Sampling settings tuned for UI grounding (greedy decoding regresses it).
const TEMPERATURE: f64 = 0.7;
const TOP_P: f64 = 0.8;

/// Completion budget per turn.
const MAX_TOKENS: u32 = 1024;

/// One prompt message. An image, when present, is attached to the final
/// user message as a data URL content part.
#[derive(Debug, Clone)]
pub struct PromptMessage {
    pub role: ChatRole,
    pub text: String,
}

impl PromptMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            text: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            text: text.into(),
        }
    }
}

/// A chat request: ordered messages plus an optional screenshot.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<PromptMessage>,
    pub image_base64: Option<String>,
}

#[derive(Serialize)]
struct WirePart<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_url: Option<Value>,
}

/// Build the OpenAI-compatible payload. Pure, so the wire shape is testable.
pub fn build_chat_payload(model: &str, request: &ChatRequest) -> Value {
    let last_user = request
        .messages
        .iter()
        .rposition(|m| m.role == ChatRole::User);

    let messages: Vec<Value> = request
        .messages
        .iter()
        .enumerate()
        .map(|(i, msg)| {
            let role = match msg.role {
                ChatRole::System => "system",
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
            };
            let mut parts = vec![WirePart {
                kind: "text",
                text: Some(&msg.text),
                image_url: None,
            }];
            if Some(i) == last_user {
                if let Some(b64) = &request.image_base64 {
                    parts.insert(
                        0,
                        WirePart {
                            kind: "image_url",
                            text: None,
                            image_url: Some(serde_json::json!({
                                "url": format!("data:image/jpeg;base64,{b64}")
                            })),
                        },
                    );
                }
            }
            serde_json::json!({ "role": role, "content": parts })
        })
        .collect();

    serde_json::json!({
        "model": model,
        "messages": messages,
        "temperature": TEMPERATURE,
        "top_p": TOP_P,
        "max_tokens": MAX_TOKENS,
    })
}

/// Client for one VLM server instance.
pub struct VlmClient {
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl VlmClient {
    pub fn new(host: &str, port: u16, model: impl Into<String>) -> Self {
        Self {
            base_url: format!("http://{host}:{port}"),
            model: model.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Point the client at a different model id (after a switch).
    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    /// One `/health` probe. `false` covers both unhealthy and unreachable.
    pub async fn check_health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .http
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Send a chat request, returning the raw completion string.
    ///
    /// Retries connection failures up to the budget with a short backoff.
    /// A timeout is not retried here; the caller decides whether the
    /// iteration budget allows another attempt.
    pub async fn chat(&self, request: &ChatRequest, timeout: Duration) -> Result<String, IrisError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let payload = build_chat_payload(&self.model, request);

        let mut last_err = String::new();
        for attempt in 0..=CHAT_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BACKOFF).await;
                debug!(attempt, "retrying vlm chat call");
            }

            let result = self
                .http
                .post(&url)
                .json(&payload)
                .timeout(timeout)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    let body: Value = resp
                        .json()
                        .await
                        .map_err(|e| IrisError::VlmUnreachable(format!("invalid body: {e}")))?;
                    return extract_completion(&body);
                }
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    last_err = format!("api error {status}: {text}");
                    warn!(attempt, %status, "vlm returned error status");
                }
                Err(e) if e.is_timeout() => {
                    return Err(IrisError::VlmTimeout {
                        seconds: timeout.as_secs(),
                    });
                }
                Err(e) => {
                    last_err = format!("connection error: {e}");
                    warn!(attempt, error = %e, "vlm connection failed");
                }
            }
        }
        Err(IrisError::VlmUnreachable(last_err))
    }
}

/// Pull `choices[0].message.content` out of a completion body.
fn extract_completion(body: &Value) -> Result<String, IrisError> {
    body["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| IrisError::VlmUnreachable("completion missing choices[0].message.content".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_image() -> ChatRequest {
        ChatRequest {
            messages: vec![
                PromptMessage::system("you control a computer"),
                PromptMessage::user("click the button"),
            ],
            image_base64: Some("QUJD".into()),
        }
    }

    #[test]
    fn payload_has_sampling_settings() {
        let payload = build_chat_payload("qwen3-vl", &request_with_image());
        assert_eq!(payload["model"], "qwen3-vl");
        assert_eq!(payload["temperature"], 0.7);
        assert_eq!(payload["top_p"], 0.8);
        assert_eq!(payload["max_tokens"], 1024);
    }

    #[test]
    fn image_attaches_to_last_user_message() {
        let payload = build_chat_payload("m", &request_with_image());
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        // System message: text only.
        assert_eq!(messages[0]["content"].as_array().unwrap().len(), 1);
        // User message: image part first, then text.
        let user = messages[1]["content"].as_array().unwrap();
        assert_eq!(user.len(), 2);
        assert_eq!(user[0]["type"], "image_url");
        assert!(user[0]["image_url"]["url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/jpeg;base64,QUJD"));
        assert_eq!(user[1]["type"], "text");
        assert_eq!(user[1]["text"], "click the button");
    }

    #[test]
    fn no_image_means_text_only() {
        let request = ChatRequest {
            messages: vec![PromptMessage::user("hello")],
            image_base64: None,
        };
        let payload = build_chat_payload("m", &request);
        let user = payload["messages"][0]["content"].as_array().unwrap();
        assert_eq!(user.len(), 1);
        assert_eq!(user[0]["type"], "text");
    }

    #[test]
    fn image_skips_assistant_turns() {
        let request = ChatRequest {
            messages: vec![
                PromptMessage::user("first"),
                PromptMessage::assistant("done that"),
            ],
            image_base64: Some("QUJD".into()),
        };
        let payload = build_chat_payload("m", &request);
        // Image goes to the last *user* message, not the trailing assistant.
        let first = payload["messages"][0]["content"].as_array().unwrap();
        assert_eq!(first.len(), 2);
        let second = payload["messages"][1]["content"].as_array().unwrap();
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn extract_completion_happy_and_missing() {
        let body = serde_json::json!({
            "choices": [{"message": {"content": "CLICK the thing"}}]
        });
        assert_eq!(extract_completion(&body).unwrap(), "CLICK the thing");

        let empty = serde_json::json!({"choices": []});
        assert!(extract_completion(&empty).is_err());
    }
}
