//! HTTP REST surface of the gateway.
//!
//! Built on axum. One guard middleware enforces rate limits and bearer
//! auth for everything except `/health` (exempt from both) and `/socket`
//! (which authenticates at the websocket handshake instead). Body size,
//! request timeout, and CORS are tower layers around the router.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::info;

use iris_types::IrisError;

use crate::auth::check_bearer;
use crate::ratelimit::{classify_path, RateLimiter};
use crate::supervisor::Supervisor;
use crate::ws::socket_handler;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared state behind every handler.
pub struct GatewayState {
    pub supervisor: Arc<Supervisor>,
    pub api_key: String,
    pub limiter: RateLimiter,
}

/// Errors from binding and running the HTTP server.
#[derive(Debug)]
pub enum ServeError {
    /// The configured port is already bound (exit code 2).
    PortInUse(String),
    /// Any other bind or serve failure.
    Other(String),
}

impl std::fmt::Display for ServeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServeError::PortInUse(msg) => write!(f, "port in use: {msg}"),
            ServeError::Other(msg) => write!(f, "server error: {msg}"),
        }
    }
}

impl std::error::Error for ServeError {}

/// Build the full REST router (without the connect-info wrapper).
pub fn build_router(state: Arc<GatewayState>) -> Router {
    let limits = &state.supervisor.config().limits;
    let server = &state.supervisor.config().server;

    let router = Router::new()
        .route("/health", get(health))
        .route("/state", get(state_handler))
        .route("/task", post(task))
        .route("/steer", post(steer))
        .route("/stop", post(stop))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .route("/chat/history", get(chat_history))
        .route("/chat/send", post(chat_send))
        .route("/stream/start", post(stream_start))
        .route("/stream/stop", post(stream_stop))
        .route("/frame/latest", get(frame_latest))
        .route("/config", get(config_view))
        .route("/models", get(models))
        .route("/model/switch", post(model_switch))
        .route("/model/active", get(model_active))
        .route("/wake-word/enable", post(wake_word_enable))
        .route("/wake-word/disable", post(wake_word_disable))
        .route("/wake-word/status", get(wake_word_status))
        .route("/agent/status", get(agent_status))
        .route("/agent/start", post(agent_start))
        .route("/agent/stop", post(agent_stop))
        .route("/agent/restart", post(agent_restart))
        .route("/socket", get(socket_handler))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), guard))
        .layer(RequestBodyLimitLayer::new(limits.max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            server.request_timeout_secs,
        )));

    let router = if server.allowed_origins.is_empty() {
        // Default: no CORS headers at all; browsers are denied, native
        // clients pass the key explicitly.
        router
    } else {
        let origins: Vec<axum::http::HeaderValue> = server
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(tower_http::cors::Any)
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
        )
    };

    router.with_state(state)
}

/// Bind and serve until the token is cancelled.
pub async fn serve(state: Arc<GatewayState>, cancel: CancellationToken) -> Result<(), ServeError> {
    let config = state.supervisor.config();
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| ServeError::Other(format!("invalid listen address: {e}")))?;

    let app = build_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            ServeError::PortInUse(addr.to_string())
        } else {
            ServeError::Other(format!("failed to bind {addr}: {e}"))
        }
    })?;

    info!(%addr, "gateway listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(cancel.cancelled_owned())
    .await
    .map_err(|e| ServeError::Other(e.to_string()))
}

/// Rate limiting plus bearer auth for every endpoint except `/health`.
async fn guard(
    State(state): State<Arc<GatewayState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    if path == "/health" {
        return next.run(req).await;
    }

    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    // Rate-limit by key when presented, source address otherwise.
    let client = auth_header
        .clone()
        .unwrap_or_else(|| addr.ip().to_string());
    if !state.limiter.allow(&client, classify_path(&path)) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "rate limit exceeded"})),
        )
            .into_response();
    }

    // The socket authenticates at its own handshake.
    if path == "/socket" {
        return next.run(req).await;
    }

    if !check_bearer(auth_header.as_deref(), &state.api_key) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid or missing API key"})),
        )
            .into_response();
    }

    next.run(req).await
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TaskBody {
    command: String,
}

#[derive(Deserialize)]
struct SteerBody {
    context: String,
}

#[derive(Deserialize)]
struct ChatBody {
    message: String,
}

#[derive(Deserialize)]
struct SwitchBody {
    model_id: String,
}

async fn health() -> impl IntoResponse {
    Json(json!({"ok": true, "version": VERSION}))
}

async fn state_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(state.supervisor.bus().snapshot_cell().snapshot())
}

async fn task(
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<TaskBody>,
) -> Response {
    match state.supervisor.submit_task(&body.command).await {
        Ok(task) => Json(json!({"task_id": task.id, "status": task.state})).into_response(),
        Err(e) => refusal(e),
    }
}

async fn steer(
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<SteerBody>,
) -> Response {
    match state.supervisor.steer(&body.context).await {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(e) => refusal(e),
    }
}

async fn stop(State(state): State<Arc<GatewayState>>) -> Response {
    match state.supervisor.stop_task().await {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(e) => refusal(e),
    }
}

async fn pause(State(state): State<Arc<GatewayState>>) -> Response {
    match state.supervisor.pause().await {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(e) => refusal(e),
    }
}

async fn resume(State(state): State<Arc<GatewayState>>) -> Response {
    match state.supervisor.resume().await {
        Ok(()) => Json(json!({"ok": true})).into_response(),
        Err(e) => refusal(e),
    }
}

async fn chat_history(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let messages = state.supervisor.bus().snapshot_cell().chat_history();
    Json(json!({"messages": messages}))
}

async fn chat_send(
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<ChatBody>,
) -> Response {
    match state.supervisor.chat_send(&body.message).await {
        Ok(outcome) => {
            let mut payload = json!({"status": "ok"});
            if let Some(task) = &outcome.task {
                payload["task_id"] = json!(task.id);
                payload["status"] = json!(task.state);
            }
            if let Some(reply) = &outcome.reply {
                payload["reply"] = json!(reply);
            }
            Json(payload).into_response()
        }
        Err(e) => refusal(e),
    }
}

async fn stream_start(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    state.supervisor.stream_start().await;
    Json(json!({"ok": true}))
}

async fn stream_stop(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    state.supervisor.stream_stop().await;
    Json(json!({"ok": true}))
}

async fn frame_latest(State(state): State<Arc<GatewayState>>) -> Response {
    match state.supervisor.bus().snapshot_cell().latest_frame() {
        Some(frame) => Json(json!({
            "image_base64": frame.to_base64(),
            "captured_at": frame.captured_at,
            "width_px": frame.width_px,
            "height_px": frame.height_px,
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "no frame captured yet"})),
        )
            .into_response(),
    }
}

async fn config_view(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(state.supervisor.config().public_view())
}

async fn models(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({"models": state.supervisor.models().await}))
}

async fn model_switch(
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<SwitchBody>,
) -> Response {
    match state.supervisor.switch_model(&body.model_id).await {
        Ok(model_id) => Json(json!({"status": "ok", "model_id": model_id})).into_response(),
        Err(IrisError::Busy) => Json(json!({"status": "busy"})).into_response(),
        Err(IrisError::Blocked(reason)) => {
            Json(json!({"status": "blocked", "reason": reason})).into_response()
        }
        Err(e) => Json(json!({"status": "error", "reason": e.to_string()})).into_response(),
    }
}

async fn model_active(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({"model_id": state.supervisor.active_model().await}))
}

async fn wake_word_enable(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    state.supervisor.set_wake_word(true);
    Json(json!({"enabled": true}))
}

async fn wake_word_disable(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    state.supervisor.set_wake_word(false);
    Json(json!({"enabled": false}))
}

async fn wake_word_status(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({"enabled": state.supervisor.wake_word_enabled()}))
}

async fn agent_status(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let (running, pid) = state.supervisor.agent_status().await;
    match pid {
        Some(pid) => Json(json!({"running": running, "pid": pid})),
        None => Json(json!({"running": running})),
    }
}

async fn agent_start(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(state.supervisor.start_agent().await)
}

async fn agent_stop(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(state.supervisor.stop_agent().await)
}

async fn agent_restart(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(state.supervisor.restart_agent().await)
}

/// Map a supervisor refusal onto the documented response bodies.
fn refusal(error: IrisError) -> Response {
    match error {
        IrisError::Busy => Json(json!({"status": "BUSY"})).into_response(),
        IrisError::Blocked(reason) => {
            Json(json!({"status": "blocked", "reason": reason})).into_response()
        }
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": other.to_string()})),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::atomic::AtomicBool;
    use tower::ServiceExt;

    use iris_agent::NullActuator;
    use iris_bus::EventBus;
    use iris_types::IrisConfig;
    use iris_vlm::VlmManager;

    fn test_state() -> Arc<GatewayState> {
        let tmp = std::env::temp_dir();
        let config = IrisConfig::default();
        let bus = EventBus::new(config.chat.history_limit);
        let running = Arc::new(AtomicBool::new(false));
        let vlm = VlmManager::new(
            config.vlm.clone(),
            tmp.clone(),
            tmp.join("iris-server-test-vlm.log"),
            bus.clone(),
            Arc::clone(&running),
        );
        let supervisor = Supervisor::new(
            config.clone(),
            bus,
            vlm,
            Arc::new(NullActuator),
            running,
            tmp.join("iris-server-test-settings.yaml"),
        );
        Arc::new(GatewayState {
            supervisor,
            api_key: "k".repeat(64),
            limiter: RateLimiter::new(config.limits.general_rpm, config.limits.lifecycle_rpm),
        })
    }

    fn request(method: &str, path: &str, auth: Option<&str>, body: Option<serde_json::Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(key) = auth {
            builder = builder.header("authorization", format!("Bearer {key}"));
        }
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let mut req = builder.body(body).unwrap();
        req.extensions_mut().insert(ConnectInfo(SocketAddr::from((
            [127, 0, 0, 1],
            45000,
        ))));
        req
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_needs_no_auth() {
        let router = build_router(test_state());
        let response = router
            .oneshot(request("GET", "/health", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["ok"], true);
        assert!(json["version"].is_string());
    }

    #[tokio::test]
    async fn missing_key_is_401() {
        let router = build_router(test_state());
        let response = router
            .oneshot(request("GET", "/state", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_key_is_401() {
        let router = build_router(test_state());
        let response = router
            .oneshot(request("GET", "/state", Some("wrongkey"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn state_with_key_returns_snapshot() {
        let state = test_state();
        let key = state.api_key.clone();
        let router = build_router(state);
        let response = router
            .oneshot(request("GET", "/state", Some(&key), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "idle");
        assert_eq!(json["vlm_status"], "OFFLINE");
    }

    #[tokio::test]
    async fn frame_latest_is_404_before_any_capture() {
        let state = test_state();
        let key = state.api_key.clone();
        let router = build_router(state);
        let response = router
            .oneshot(request("GET", "/frame/latest", Some(&key), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_model_switch_reports_error_status() {
        let state = test_state();
        let key = state.api_key.clone();
        let router = build_router(state);
        let response = router
            .oneshot(request(
                "POST",
                "/model/switch",
                Some(&key),
                Some(json!({"model_id": "ghost"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "error");
    }

    #[tokio::test]
    async fn lifecycle_endpoints_rate_limit_at_ten() {
        let state = test_state();
        let key = state.api_key.clone();
        let router = build_router(Arc::clone(&state));

        for i in 0..10 {
            let response = router
                .clone()
                .oneshot(request("POST", "/agent/start", Some(&key), None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "request {i} allowed");
        }
        let response = router
            .oneshot(request("POST", "/agent/start", Some(&key), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        state.supervisor.stop_agent().await;
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let state = test_state();
        let key = state.api_key.clone();
        let router = build_router(state);

        let huge = "x".repeat(2 * 1024 * 1024);
        let response = router
            .oneshot(request(
                "POST",
                "/task",
                Some(&key),
                Some(json!({"command": huge})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn wake_word_round_trip() {
        let state = test_state();
        let key = state.api_key.clone();
        let router = build_router(state);

        let response = router
            .clone()
            .oneshot(request("POST", "/wake-word/enable", Some(&key), None))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["enabled"], true);

        let response = router
            .clone()
            .oneshot(request("GET", "/wake-word/status", Some(&key), None))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["enabled"], true);

        let response = router
            .oneshot(request("POST", "/wake-word/disable", Some(&key), None))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["enabled"], false);
    }

    #[tokio::test]
    async fn agent_status_reports_not_running() {
        let state = test_state();
        let key = state.api_key.clone();
        let router = build_router(state);
        let response = router
            .oneshot(request("GET", "/agent/status", Some(&key), None))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["running"], false);
        assert!(json.get("pid").is_none());
    }
}
