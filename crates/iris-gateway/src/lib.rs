//! The Iris gateway: the always-on process that owns everything.
//!
//! Composes the event bus, the VLM lifecycle manager, and the agent worker
//! behind an authenticated REST + websocket surface, with per-client rate
//! limits, a restart circuit breaker, a memory guard, a proactive
//! heartbeat, and single-instance enforcement.

pub mod auth;
pub mod heartbeat;
pub mod instance;
pub mod ratelimit;
pub mod server;
pub mod supervisor;
pub mod ws;

pub use auth::{check_bearer, constant_time_eq, generate_api_key, load_or_create_key};
pub use heartbeat::{pending_items, within_active_hours, Heartbeat};
pub use instance::InstanceLock;
pub use ratelimit::{classify_path, RateLimiter, RequestClass};
pub use server::{build_router, serve, GatewayState, ServeError, VERSION};
pub use supervisor::{available_memory_mb, ChatSendOutcome, LifecycleOutcome, Supervisor};
