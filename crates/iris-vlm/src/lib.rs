//! VLM server lifecycle for Iris.
//!
//! Supervises the external llama-server child process: readiness probing,
//! a single warm-up completion, idle hold, crash detection with exponential
//! backoff, a crash-burst circuit breaker, serialized model switching, and
//! the OpenAI-compatible chat client the orchestrator talks through.

pub mod breaker;
pub mod catalog;
pub mod client;
pub mod manager;
pub mod process;

pub use breaker::{CircuitBreaker, Clock, SystemClock};
pub use catalog::{ModelCatalog, ModelInfo};
pub use client::{build_chat_payload, ChatRequest, PromptMessage, VlmClient};
pub use manager::{backoff_delay, Phase, Readiness, VlmManager};
pub use process::{build_server_args, server_executable, VlmProcess};
