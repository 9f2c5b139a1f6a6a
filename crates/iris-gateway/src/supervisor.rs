//! The gateway supervisor: owns the VLM manager, the agent worker, and the
//! event bus, and enforces the guards around worker lifecycle.
//!
//! At most one agent worker exists. Starting one is refused while the
//! restart circuit breaker is open (three crashes in a rolling ten minutes)
//! or when available system memory is below the configured floor. Stopping
//! cancels the worker cooperatively and escalates to an abort if it fails
//! to drain within the shutdown window.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Timelike;
use serde::Serialize;
use sysinfo::System;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use iris_agent::{Actuator, Orchestrator, OrchestratorHandle, VlmLink};
use iris_bus::EventBus;
use iris_types::{
    ChatMessage, Event, EventPayload, IrisConfig, IrisError, Task,
};
use iris_vlm::{CircuitBreaker, ModelInfo, VlmManager};

use crate::heartbeat::Heartbeat;

/// Worker drain window before force-abort.
const SHUTDOWN_WINDOW: Duration = Duration::from_secs(2);

/// Idle screen-stream cadence.
const STREAM_INTERVAL: Duration = Duration::from_millis(500);

/// Agent restart breaker: 3 crashes in 10 minutes blocks restarts for 10.
const RESTART_THRESHOLD: u32 = 3;
const RESTART_WINDOW: Duration = Duration::from_secs(600);
const RESTART_COOLDOWN: Duration = Duration::from_secs(600);

/// Result of a lifecycle endpoint (`/agent/start|stop|restart`).
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleOutcome {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl LifecycleOutcome {
    fn ok() -> Self {
        Self {
            status: "ok".into(),
            reason: None,
        }
    }

    fn ok_with(reason: &str) -> Self {
        Self {
            status: "ok".into(),
            reason: Some(reason.into()),
        }
    }

    fn blocked(reason: String) -> Self {
        Self {
            status: "blocked".into(),
            reason: Some(reason),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.status == "blocked"
    }
}

/// Outcome of `/chat/send`: either a spawned task or a direct reply.
#[derive(Debug, Clone, Serialize)]
pub struct ChatSendOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
}

struct AgentWorker {
    handle: OrchestratorHandle,
    cancel: CancellationToken,
    monitor: JoinHandle<()>,
    stopping: Arc<AtomicBool>,
}

/// The always-on gateway core.
pub struct Supervisor {
    config: IrisConfig,
    bus: EventBus,
    vlm: Arc<VlmManager>,
    actuator: Arc<dyn Actuator>,
    running_flag: Arc<AtomicBool>,
    worker: Mutex<Option<AgentWorker>>,
    restart_breaker: std::sync::Mutex<CircuitBreaker>,
    wake_word: AtomicBool,
    stream_cancel: Mutex<Option<CancellationToken>>,
    settings_path: PathBuf,
}

impl Supervisor {
    pub fn new(
        config: IrisConfig,
        bus: EventBus,
        vlm: Arc<VlmManager>,
        actuator: Arc<dyn Actuator>,
        running_flag: Arc<AtomicBool>,
        settings_path: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            bus,
            vlm,
            actuator,
            running_flag,
            worker: Mutex::new(None),
            restart_breaker: std::sync::Mutex::new(CircuitBreaker::new(
                RESTART_THRESHOLD,
                RESTART_WINDOW,
                RESTART_COOLDOWN,
            )),
            wake_word: AtomicBool::new(false),
            stream_cancel: Mutex::new(None),
            settings_path,
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &IrisConfig {
        &self.config
    }

    // -- agent worker lifecycle --------------------------------------------

    /// Start the agent worker. No-op when already running and healthy.
    pub async fn start_agent(self: &Arc<Self>) -> LifecycleOutcome {
        let mut worker = self.worker.lock().await;
        if let Some(existing) = worker.as_ref() {
            if !existing.monitor.is_finished() {
                return LifecycleOutcome::ok_with("already running");
            }
        }

        if self.lock_breaker().is_tripped() {
            let crashes = self.lock_breaker().failure_count();
            return LifecycleOutcome::blocked(format!(
                "crash loop: {crashes} recent agent crashes"
            ));
        }
        let available = available_memory_mb();
        if available < self.config.limits.memory_floor_mb {
            return LifecycleOutcome::blocked(format!(
                "low memory: {available} MiB available, floor is {} MiB",
                self.config.limits.memory_floor_mb
            ));
        }

        let (orchestrator, handle) = Orchestrator::new(
            Arc::clone(&self.vlm) as Arc<dyn VlmLink>,
            Arc::clone(&self.actuator),
            self.bus.clone(),
            self.config.safety.clone(),
            Duration::from_secs(self.config.vlm.chat_timeout_secs),
            self.config.chat.history_limit,
            Arc::clone(&self.running_flag),
        );

        let cancel = CancellationToken::new();
        let run_task = tokio::spawn(orchestrator.run(cancel.clone()));

        let stopping = Arc::new(AtomicBool::new(false));
        let monitor = {
            let supervisor = Arc::downgrade(self);
            let stopping = Arc::clone(&stopping);
            tokio::spawn(async move {
                let result = run_task.await;
                let Some(supervisor) = supervisor.upgrade() else {
                    return;
                };
                supervisor.bus.snapshot_cell().set_pid(None);
                supervisor.running_flag.store(false, Ordering::Release);
                if !stopping.load(Ordering::Acquire) {
                    let detail = match result {
                        Err(e) => format!("agent worker crashed: {e}"),
                        Ok(()) => "agent worker exited unexpectedly".to_string(),
                    };
                    warn!(detail, "unexpected agent worker exit");
                    supervisor.lock_breaker().record_failure();
                    supervisor.bus.publish(Event::new(EventPayload::Status {
                        state: None,
                        vlm_status: None,
                        details: Some(detail),
                    }));
                }
            })
        };

        *worker = Some(AgentWorker {
            handle,
            cancel,
            monitor,
            stopping,
        });
        self.bus
            .snapshot_cell()
            .set_pid(Some(std::process::id()));
        info!("agent worker started");
        LifecycleOutcome::ok()
    }

    /// Stop the agent worker, force-aborting past the shutdown window.
    pub async fn stop_agent(&self) -> LifecycleOutcome {
        let taken = self.worker.lock().await.take();
        let Some(worker) = taken else {
            return LifecycleOutcome::ok_with("not running");
        };

        worker.stopping.store(true, Ordering::Release);
        let _ = worker.handle.stop().await;
        worker.cancel.cancel();

        let abort = worker.monitor.abort_handle();
        match tokio::time::timeout(SHUTDOWN_WINDOW, worker.monitor).await {
            Ok(_) => {}
            Err(_) => {
                warn!("agent worker did not drain in time, force-aborting");
                abort.abort();
            }
        }
        self.bus.snapshot_cell().set_pid(None);
        self.running_flag.store(false, Ordering::Release);
        info!("agent worker stopped");
        LifecycleOutcome::ok()
    }

    pub async fn restart_agent(self: &Arc<Self>) -> LifecycleOutcome {
        let stopped = self.stop_agent().await;
        if stopped.is_blocked() {
            return stopped;
        }
        self.start_agent().await
    }

    /// `(running, pid)` for `/agent/status`.
    pub async fn agent_status(&self) -> (bool, Option<u32>) {
        let worker = self.worker.lock().await;
        match worker.as_ref() {
            Some(w) if !w.monitor.is_finished() => (true, Some(std::process::id())),
            _ => (false, None),
        }
    }

    /// Crashes recorded in the restart breaker's window (tests, /config).
    pub fn agent_crash_count(&self) -> u32 {
        self.lock_breaker().failure_count()
    }

    /// Record one agent crash (exposed for the monitor path and tests).
    pub fn record_agent_crash(&self) {
        self.lock_breaker().record_failure();
    }

    // -- task and chat surface ---------------------------------------------

    /// Get a handle to a running worker, starting one if necessary.
    async fn ensure_worker(self: &Arc<Self>) -> Result<OrchestratorHandle, IrisError> {
        {
            let worker = self.worker.lock().await;
            if let Some(w) = worker.as_ref() {
                if !w.monitor.is_finished() {
                    return Ok(w.handle.clone());
                }
            }
        }
        let outcome = self.start_agent().await;
        if outcome.is_blocked() {
            return Err(IrisError::Blocked(
                outcome.reason.unwrap_or_else(|| "blocked".into()),
            ));
        }
        let worker = self.worker.lock().await;
        worker
            .as_ref()
            .map(|w| w.handle.clone())
            .ok_or_else(|| IrisError::Blocked("agent worker unavailable".into()))
    }

    pub async fn submit_task(self: &Arc<Self>, command: &str) -> Result<Task, IrisError> {
        let handle = self.ensure_worker().await?;
        handle.submit_task(command).await
    }

    pub async fn steer(&self, context: &str) -> Result<(), IrisError> {
        if let Some(handle) = self.current_handle().await {
            handle.steer(context).await?;
        }
        Ok(())
    }

    pub async fn pause(&self) -> Result<(), IrisError> {
        if let Some(handle) = self.current_handle().await {
            handle.pause().await?;
        }
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), IrisError> {
        if let Some(handle) = self.current_handle().await {
            handle.resume().await?;
        }
        Ok(())
    }

    pub async fn stop_task(&self) -> Result<(), IrisError> {
        if let Some(handle) = self.current_handle().await {
            handle.stop().await?;
        }
        Ok(())
    }

    pub async fn clear_chat(&self) -> Result<(), IrisError> {
        if let Some(handle) = self.current_handle().await {
            handle.clear_chat().await?;
        } else {
            self.bus.snapshot_cell().clear_chat();
        }
        Ok(())
    }

    /// `/chat/send`: task-generating by default; with the intent gate on,
    /// conversational messages get a direct reply instead.
    pub async fn chat_send(self: &Arc<Self>, message: &str) -> Result<ChatSendOutcome, IrisError> {
        if !self.config.chat.intent_gate {
            let task = self.submit_task(message).await?;
            return Ok(ChatSendOutcome {
                task: Some(task),
                reply: None,
            });
        }

        self.bus.publish(Event::new(EventPayload::ChatMessage(
            ChatMessage::user(message.to_string()),
        )));

        let request = iris_vlm::ChatRequest {
            messages: vec![
                iris_vlm::PromptMessage::system(iris_agent::INTENT_PROMPT),
                iris_vlm::PromptMessage::user(message.to_string()),
            ],
            image_base64: None,
        };
        let timeout = Duration::from_secs(self.config.vlm.chat_timeout_secs);
        let intent = match self.vlm.chat(&request, timeout).await {
            Ok(raw) => iris_agent::parse_intent(&raw),
            Err(e) => Err(e),
        };

        match intent {
            Ok(iris_agent::ChatIntent::Chat { reply }) => {
                self.bus.publish(Event::new(EventPayload::ChatMessage(
                    ChatMessage::assistant(reply.clone()),
                )));
                Ok(ChatSendOutcome {
                    task: None,
                    reply: Some(reply),
                })
            }
            Ok(iris_agent::ChatIntent::Task { reply, command }) => {
                if !reply.is_empty() {
                    self.bus.publish(Event::new(EventPayload::ChatMessage(
                        ChatMessage::assistant(reply.clone()),
                    )));
                }
                let task = self.submit_task(&command).await?;
                Ok(ChatSendOutcome {
                    task: Some(task),
                    reply: Some(reply),
                })
            }
            Ok(iris_agent::ChatIntent::Screen { reply }) => {
                let task = self
                    .submit_task("Look at the screen and describe what you see.")
                    .await?;
                Ok(ChatSendOutcome {
                    task: Some(task),
                    reply: Some(reply),
                })
            }
            Err(e) => {
                // The gate is best-effort; fall back to the task alias.
                warn!(error = %e, "intent gate failed, treating message as task");
                let task = self.submit_task(message).await?;
                Ok(ChatSendOutcome {
                    task: Some(task),
                    reply: None,
                })
            }
        }
    }

    async fn current_handle(&self) -> Option<OrchestratorHandle> {
        let worker = self.worker.lock().await;
        worker
            .as_ref()
            .filter(|w| !w.monitor.is_finished())
            .map(|w| w.handle.clone())
    }

    // -- models -------------------------------------------------------------

    pub async fn models(&self) -> Vec<ModelInfo> {
        self.vlm.models().await
    }

    pub async fn active_model(&self) -> String {
        self.vlm.active_model().await
    }

    /// Switch the VLM model and persist the selection.
    pub async fn switch_model(&self, model_id: &str) -> Result<String, IrisError> {
        self.vlm.switch_model(model_id).await?;
        self.persist_active_model(model_id);
        Ok(model_id.to_string())
    }

    fn persist_active_model(&self, model_id: &str) {
        let mut on_disk = if self.settings_path.exists() {
            match std::fs::read_to_string(&self.settings_path)
                .map_err(|e| IrisError::Config(e.to_string()))
                .and_then(|content| IrisConfig::from_yaml(&content))
            {
                Ok(config) => config,
                Err(e) => {
                    warn!(error = %e, "cannot re-read settings, skipping model persistence");
                    return;
                }
            }
        } else {
            self.config.clone()
        };

        on_disk.vlm.active_model = model_id.to_string();
        let result = on_disk.to_yaml().and_then(|yaml| {
            if let Some(parent) = self.settings_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&self.settings_path, yaml).map_err(IrisError::from)
        });
        match result {
            Ok(()) => info!(model = model_id, "active model persisted"),
            Err(e) => warn!(error = %e, "failed to persist active model"),
        }
    }

    // -- wake word & stream -------------------------------------------------

    pub fn set_wake_word(&self, enabled: bool) {
        self.wake_word.store(enabled, Ordering::Release);
    }

    pub fn wake_word_enabled(&self) -> bool {
        self.wake_word.load(Ordering::Acquire)
    }

    /// Start the idle screen stream (frames for observers between tasks).
    ///
    /// While a task runs the orchestrator owns the actuator, so the stream
    /// stays quiet and observers see the loop's own frames.
    pub async fn stream_start(self: &Arc<Self>) {
        let mut stream = self.stream_cancel.lock().await;
        if stream.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        *stream = Some(cancel.clone());

        let supervisor = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(STREAM_INTERVAL) => {}
                }
                let Some(supervisor) = supervisor.upgrade() else {
                    return;
                };
                if supervisor.running_flag.load(Ordering::Acquire) {
                    continue;
                }
                match tokio::time::timeout(Duration::from_secs(2), supervisor.actuator.capture())
                    .await
                {
                    Ok(Ok(frame)) => {
                        supervisor.bus.publish(Event::frame(Arc::new(frame)));
                    }
                    Ok(Err(e)) => warn!(error = %e, "stream capture failed"),
                    Err(_) => warn!("stream capture timed out"),
                }
            }
        });
        info!("screen stream started");
    }

    pub async fn stream_stop(&self) {
        if let Some(cancel) = self.stream_cancel.lock().await.take() {
            cancel.cancel();
            info!("screen stream stopped");
        }
    }

    // -- heartbeat ----------------------------------------------------------

    /// Periodic proactive wake-ups; publishes synthesized chat messages.
    pub async fn run_heartbeat(self: Arc<Self>, mut heartbeat: Heartbeat, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(60)) => {}
            }
            if !heartbeat.is_due() {
                continue;
            }
            let hour = chrono::Local::now().hour() as u8;
            if let Some(message) = heartbeat.tick(hour) {
                info!(content = message.content, "heartbeat message synthesized");
                self.bus
                    .publish(Event::new(EventPayload::ChatMessage(message)));
            }
        }
    }

    fn lock_breaker(&self) -> std::sync::MutexGuard<'_, CircuitBreaker> {
        match self.restart_breaker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Available system memory in MiB.
pub fn available_memory_mb() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    system.available_memory() / (1024 * 1024)
}
