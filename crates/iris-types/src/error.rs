//! Error types shared across all Iris crates.

/// Errors that can occur across the Iris runtime.
///
/// Each variant corresponds to a failure class with its own propagation
/// policy: configuration errors are fatal at startup, VLM errors are
/// retried inside the lifecycle manager, parse/safety errors consume an
/// iteration of the control loop, and `Busy`/`Blocked` are synchronous
/// refusals returned to the caller.
#[derive(Debug, thiserror::Error)]
pub enum IrisError {
    /// Configuration loading or validation failure. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// The VLM server could not be reached after the retry budget.
    #[error("vlm unreachable: {0}")]
    VlmUnreachable(String),

    /// A VLM chat call exceeded its deadline. The process is left intact.
    #[error("vlm request timed out after {seconds}s")]
    VlmTimeout { seconds: u64 },

    /// No well-formed action envelope could be extracted from model output.
    #[error("unparseable model output: {0}")]
    Parse(String),

    /// An action was refused by a safety gate before execution.
    #[error("safety gate blocked action: {0}")]
    SafetyBlock(String),

    /// The actuator failed to capture the screen or apply an action.
    #[error("actuator error: {0}")]
    Actuator(String),

    /// The control loop hit its per-task iteration cap.
    #[error("max iterations reached ({limit})")]
    MaxIterations { limit: u32 },

    /// A task is already running; the request was refused without state change.
    #[error("a task is already running")]
    Busy,

    /// Refused by a circuit breaker or resource guard.
    #[error("blocked: {0}")]
    Blocked(String),

    /// The operation was cancelled cooperatively (stop or shutdown).
    #[error("cancelled")]
    Cancelled,

    /// Filesystem or OS-level failure (lock files, key persistence, logs).
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for IrisError {
    fn from(e: std::io::Error) -> Self {
        IrisError::Io(e.to_string())
    }
}
