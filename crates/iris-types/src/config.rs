//! Configuration for the Iris gateway and its components.
//!
//! [`IrisConfig`] is loaded from `<root>/config/settings.yaml`, with
//! `HOST`/`PORT` environment variables taking precedence over file values.
//! The file is user-editable; `GET /config` exposes only the public subset.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::IrisError;

/// HTTP bind settings for the gateway itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address. Overridden by the `HOST` environment variable.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port. Overridden by the `PORT` environment variable.
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Origins allowed by CORS. Default: none (clients pass the key explicitly).
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Total per-request timeout on the gateway side.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_gateway_port(),
            allowed_origins: Vec::new(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// One launchable model profile for the VLM server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfileConfig {
    /// Human-readable name shown in `/models`.
    pub display_name: String,
    /// Path to the main GGUF weights file, relative to the Iris root.
    pub model_file: PathBuf,
    /// Path to the multimodal projector file.
    pub mmproj_file: PathBuf,
    #[serde(default = "default_context_size")]
    pub context_size: u32,
    #[serde(default = "default_gpu_layers")]
    pub gpu_layers: u32,
    /// Whether this profile may be selected (weights shipped/downloaded).
    #[serde(default = "default_true")]
    pub available: bool,
}

/// VLM server process and chat-client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VlmConfig {
    /// Explicit path to the server executable; searched on PATH when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<PathBuf>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_vlm_port")]
    pub port: u16,
    /// Profile id to launch; must be a key of `profiles`.
    pub active_model: String,
    #[serde(default)]
    pub profiles: BTreeMap<String, ModelProfileConfig>,
    /// Deadline for the health probe plus warm-up chat to succeed.
    #[serde(default = "default_warmup_deadline")]
    pub warmup_deadline_secs: u64,
    /// No chat for this long moves the process to idle hold.
    #[serde(default = "default_idle_hold")]
    pub idle_hold_secs: u64,
    /// Per-chat-call deadline.
    #[serde(default = "default_chat_timeout")]
    pub chat_timeout_secs: u64,
    /// Grace period after SIGTERM before escalating.
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
}

impl Default for VlmConfig {
    fn default() -> Self {
        Self {
            executable: None,
            host: default_host(),
            port: default_vlm_port(),
            active_model: "qwen3-vl-4b".into(),
            profiles: default_profiles(),
            warmup_deadline_secs: default_warmup_deadline(),
            idle_hold_secs: default_idle_hold(),
            chat_timeout_secs: default_chat_timeout(),
            stop_grace_secs: default_stop_grace(),
        }
    }
}

/// Safety gates applied to every action before execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Minimum model confidence; equality passes.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Maximum VLM calls per task.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Pause after each actuator action for the UI to respond.
    #[serde(default = "default_post_action_delay")]
    pub post_action_delay_ms: u64,
    /// Permitted action names; empty means all kinds are permitted.
    #[serde(default)]
    pub permitted_actions: Vec<String>,
    /// Calibration offsets added after normalized-to-pixel conversion.
    #[serde(default)]
    pub click_offset_x: i32,
    #[serde(default)]
    pub click_offset_y: i32,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            max_iterations: default_max_iterations(),
            post_action_delay_ms: default_post_action_delay(),
            permitted_actions: Vec::new(),
            click_offset_x: 0,
            click_offset_y: 0,
        }
    }
}

/// Proactive heartbeat settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_interval")]
    pub interval_minutes: u64,
    /// Hour of day (0-23) the heartbeat becomes active.
    #[serde(default = "default_active_start")]
    pub active_hours_start: u8,
    /// Hour of day (0-24) the heartbeat goes quiet.
    #[serde(default = "default_active_end")]
    pub active_hours_end: u8,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: default_heartbeat_interval(),
            active_hours_start: default_active_start(),
            active_hours_end: default_active_end(),
        }
    }
}

/// Chat routing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// When true, `/chat/send` first classifies the message and only
    /// enqueues a task for actionable requests; plain conversation gets a
    /// reply without driving the desktop. When false, chat aliases to task.
    #[serde(default)]
    pub intent_gate: bool,
    /// Messages retained in the session history.
    #[serde(default = "default_chat_history")]
    pub history_limit: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            intent_gate: false,
            history_limit: default_chat_history(),
        }
    }
}

/// Gateway resource limits and guards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Token-bucket budget for general endpoints, per client per minute.
    #[serde(default = "default_general_rpm")]
    pub general_rpm: u32,
    /// Token-bucket budget for lifecycle endpoints, per client per minute.
    #[serde(default = "default_lifecycle_rpm")]
    pub lifecycle_rpm: u32,
    /// Maximum accepted request body.
    #[serde(default = "default_max_body")]
    pub max_body_bytes: usize,
    /// Refuse to spawn the agent worker below this much available memory.
    #[serde(default = "default_memory_floor")]
    pub memory_floor_mb: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            general_rpm: default_general_rpm(),
            lifecycle_rpm: default_lifecycle_rpm(),
            max_body_bytes: default_max_body(),
            memory_floor_mb: default_memory_floor(),
        }
    }
}

/// Top-level configuration, one section per concern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IrisConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub vlm: VlmConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl IrisConfig {
    /// Parse a configuration from a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self, IrisError> {
        serde_yaml::from_str(content).map_err(|e| IrisError::Config(e.to_string()))
    }

    /// Serialize the configuration to YAML.
    pub fn to_yaml(&self) -> Result<String, IrisError> {
        serde_yaml::to_string(self).map_err(|e| IrisError::Config(e.to_string()))
    }

    /// Load from a settings file, fall back to defaults when it is absent,
    /// then apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, IrisError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| IrisError::Config(format!("cannot read {}: {e}", path.display())))?;
            Self::from_yaml(&content)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// `HOST` and `PORT` environment variables override file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("HOST") {
            if !host.is_empty() {
                self.server.host = host;
            }
        }
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.server.port = port;
            }
        }
    }

    /// Reject configurations the runtime cannot operate under.
    pub fn validate(&self) -> Result<(), IrisError> {
        if !(0.0..=1.0).contains(&self.safety.confidence_threshold) {
            return Err(IrisError::Config(format!(
                "safety.confidence_threshold {} outside [0, 1]",
                self.safety.confidence_threshold
            )));
        }
        if self.safety.max_iterations == 0 {
            return Err(IrisError::Config("safety.max_iterations must be > 0".into()));
        }
        if self.heartbeat.active_hours_start > 23 || self.heartbeat.active_hours_end > 24 {
            return Err(IrisError::Config(
                "heartbeat active hours must be within 0-23 / 0-24".into(),
            ));
        }
        if self.server.port == self.vlm.port && self.server.host == self.vlm.host {
            return Err(IrisError::Config(format!(
                "gateway and vlm cannot share {}:{}",
                self.server.host, self.server.port
            )));
        }
        if !self.vlm.profiles.is_empty() && !self.vlm.profiles.contains_key(&self.vlm.active_model)
        {
            return Err(IrisError::Config(format!(
                "active_model {:?} is not a configured profile",
                self.vlm.active_model
            )));
        }
        Ok(())
    }

    /// The subset of configuration served by `GET /config`.
    ///
    /// Paths, executables, and anything security-adjacent stay private.
    pub fn public_view(&self) -> serde_json::Value {
        serde_json::json!({
            "server": {
                "host": self.server.host,
                "port": self.server.port,
            },
            "vlm": {
                "active_model": self.vlm.active_model,
                "idle_hold_secs": self.vlm.idle_hold_secs,
                "chat_timeout_secs": self.vlm.chat_timeout_secs,
            },
            "safety": {
                "confidence_threshold": self.safety.confidence_threshold,
                "max_iterations": self.safety.max_iterations,
                "post_action_delay_ms": self.safety.post_action_delay_ms,
            },
            "heartbeat": {
                "enabled": self.heartbeat.enabled,
                "interval_minutes": self.heartbeat.interval_minutes,
            },
            "chat": {
                "intent_gate": self.chat.intent_gate,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Filesystem layout
// ---------------------------------------------------------------------------

/// Root directory for all persisted state. `IRIS_HOME` overrides the default
/// of `~/.iris`.
pub fn root_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("IRIS_HOME") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".iris")
}

/// User-editable settings file.
pub fn settings_path() -> PathBuf {
    root_dir().join("config").join("settings.yaml")
}

/// Persisted API key (mode 600).
pub fn api_key_path() -> PathBuf {
    root_dir().join("config").join("secrets").join("api_key")
}

/// Gateway and VLM server logs.
pub fn logs_dir() -> PathBuf {
    root_dir().join("logs")
}

/// Data directory (heartbeat checklist, optional memory store).
pub fn data_dir() -> PathBuf {
    root_dir().join("data")
}

/// Heartbeat checklist read by the proactive heartbeat task.
pub fn heartbeat_path() -> PathBuf {
    data_dir().join("HEARTBEAT.md")
}

/// Single-instance lock file.
pub fn lock_path() -> PathBuf {
    root_dir().join("iris.lock")
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_gateway_port() -> u16 {
    8000
}

fn default_vlm_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    10
}

fn default_context_size() -> u32 {
    8192
}

fn default_gpu_layers() -> u32 {
    40
}

fn default_warmup_deadline() -> u64 {
    120
}

fn default_idle_hold() -> u64 {
    600
}

fn default_chat_timeout() -> u64 {
    90
}

fn default_stop_grace() -> u64 {
    5
}

fn default_confidence_threshold() -> f64 {
    0.8
}

fn default_max_iterations() -> u32 {
    20
}

fn default_post_action_delay() -> u64 {
    100
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_active_start() -> u8 {
    9
}

fn default_active_end() -> u8 {
    23
}

fn default_chat_history() -> usize {
    200
}

fn default_general_rpm() -> u32 {
    120
}

fn default_lifecycle_rpm() -> u32 {
    10
}

fn default_max_body() -> usize {
    1024 * 1024
}

fn default_memory_floor() -> u64 {
    512
}

fn default_true() -> bool {
    true
}

fn default_profiles() -> BTreeMap<String, ModelProfileConfig> {
    let mut profiles = BTreeMap::new();
    profiles.insert(
        "qwen3-vl-4b".into(),
        ModelProfileConfig {
            display_name: "Qwen3-VL 4B".into(),
            model_file: PathBuf::from("models/Qwen3VL-4B-Instruct-Q4_K_M.gguf"),
            mmproj_file: PathBuf::from("models/mmproj-Qwen3VL-4B-Instruct-F16.gguf"),
            context_size: default_context_size(),
            gpu_layers: default_gpu_layers(),
            available: true,
        },
    );
    profiles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = IrisConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.vlm.port, 8080);
        assert_eq!(config.safety.confidence_threshold, 0.8);
        assert_eq!(config.safety.max_iterations, 20);
        assert_eq!(config.limits.general_rpm, 120);
        assert_eq!(config.limits.lifecycle_rpm, 10);
    }

    #[test]
    fn yaml_roundtrip() {
        let config = IrisConfig::default();
        let yaml = config.to_yaml().unwrap();
        let back = IrisConfig::from_yaml(&yaml).unwrap();
        assert_eq!(back.vlm.active_model, config.vlm.active_model);
        assert_eq!(back.safety.max_iterations, 20);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let yaml = r#"
server:
  port: 9001
safety:
  confidence_threshold: 0.9
"#;
        let config = IrisConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.safety.confidence_threshold, 0.9);
        // Untouched sections keep defaults.
        assert_eq!(config.safety.max_iterations, 20);
        assert_eq!(config.vlm.chat_timeout_secs, 90);
    }

    #[test]
    fn validate_rejects_bad_threshold() {
        let mut config = IrisConfig::default();
        config.safety.confidence_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_iterations() {
        let mut config = IrisConfig::default();
        config.safety.max_iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_port_collision() {
        let mut config = IrisConfig::default();
        config.server.port = config.vlm.port;
        config.server.host = config.vlm.host.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_active_model() {
        let mut config = IrisConfig::default();
        config.vlm.active_model = "missing".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = IrisConfig::load(&tmp.path().join("nope.yaml")).unwrap();
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn public_view_hides_paths() {
        let config = IrisConfig::default();
        let view = config.public_view();
        let text = view.to_string();
        assert!(!text.contains("gguf"), "model paths must stay private");
        assert!(!text.contains("memory_floor"), "guard limits stay private");
        assert_eq!(view["safety"]["max_iterations"], 20);
    }

    #[test]
    fn settings_paths_follow_layout() {
        assert!(settings_path().ends_with("config/settings.yaml"));
        assert!(api_key_path().ends_with("config/secrets/api_key"));
        assert!(heartbeat_path().ends_with("data/HEARTBEAT.md"));
    }
}
