//! VLM lifecycle manager: owns the server child process end to end.
//!
//! State machine: `Off -> Starting -> Ready -> IdleHold -> Stopping -> Off`,
//! with crashes re-entering `Off` under exponential backoff. The manager
//! runs a supervision loop ([`VlmManager::run`]) that detects child death,
//! counts probe failures, applies idle hold, and restarts after backoff.
//! Three crashes inside a five-minute window trip the circuit breaker;
//! `ensure_ready` then reports `Failed("BLOCKED")` until the trip expires
//! or an operator resets it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use iris_bus::EventBus;
use iris_types::{Event, IrisError, VlmConfig, VlmStatus};

use crate::breaker::CircuitBreaker;
use crate::catalog::{ModelCatalog, ModelInfo};
use crate::client::{ChatRequest, VlmClient};
use crate::process::VlmProcess;

/// Health probe cadence while starting.
const STARTUP_PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// Consecutive probe failures in `Ready` that count as a crash.
const PROBE_FAILURE_LIMIT: u32 = 5;

/// Crash backoff cap.
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Crash-burst breaker: 3 crashes in 5 minutes trips for 5 minutes.
const CRASH_THRESHOLD: u32 = 3;
const CRASH_WINDOW: Duration = Duration::from_secs(300);
const CRASH_COOLDOWN: Duration = Duration::from_secs(300);

/// Prompt used for the single warm-up call.
const WARMUP_PROMPT: &str = "Reply with the single word: ready";

/// Lifecycle phase of the managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Off,
    Starting,
    Ready,
    IdleHold,
    Stopping,
}

impl Phase {
    pub fn as_vlm_status(self) -> VlmStatus {
        match self {
            Phase::Off => VlmStatus::Offline,
            Phase::Starting => VlmStatus::Starting,
            Phase::Ready => VlmStatus::Ready,
            Phase::IdleHold => VlmStatus::IdleHold,
            Phase::Stopping => VlmStatus::Stopping,
        }
    }
}

/// Outcome of `ensure_ready`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Starting,
    Failed(String),
}

/// Backoff delay for the n-th consecutive crash (0-based): 1, 2, 4, ... 30s.
pub fn backoff_delay(crash_streak: u32) -> Duration {
    let secs = 1u64 << crash_streak.min(5);
    Duration::from_secs(secs).min(BACKOFF_CAP)
}

struct Runtime {
    process: Option<VlmProcess>,
    want_running: bool,
    startup_in_flight: bool,
    last_chat: Instant,
    probe_failures: u32,
    crash_streak: u32,
    backoff_until: Option<Instant>,
    warmup_latency_ms: Option<u64>,
}

/// Owns the VLM server child, its readiness, and its crash policy.
pub struct VlmManager {
    config: VlmConfig,
    catalog: Mutex<ModelCatalog>,
    client: RwLock<VlmClient>,
    runtime: Mutex<Runtime>,
    phase_tx: watch::Sender<Phase>,
    breaker: std::sync::Mutex<CircuitBreaker>,
    bus: EventBus,
    /// Set by the gateway while a task is running; blocks model switches.
    task_running: Arc<AtomicBool>,
    switch_lock: Mutex<()>,
    log_path: PathBuf,
}

impl VlmManager {
    pub fn new(
        config: VlmConfig,
        root: PathBuf,
        log_path: PathBuf,
        bus: EventBus,
        task_running: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let catalog = ModelCatalog::new(&config, root);
        let client = VlmClient::new(&config.host, config.port, config.active_model.clone());
        let (phase_tx, _) = watch::channel(Phase::Off);
        Arc::new(Self {
            config,
            catalog: Mutex::new(catalog),
            client: RwLock::new(client),
            runtime: Mutex::new(Runtime {
                process: None,
                want_running: false,
                startup_in_flight: false,
                last_chat: Instant::now(),
                probe_failures: 0,
                crash_streak: 0,
                backoff_until: None,
                warmup_latency_ms: None,
            }),
            phase_tx,
            breaker: std::sync::Mutex::new(CircuitBreaker::new(
                CRASH_THRESHOLD,
                CRASH_WINDOW,
                CRASH_COOLDOWN,
            )),
            bus,
            task_running,
            switch_lock: Mutex::new(()),
            log_path,
        })
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        *self.phase_tx.borrow()
    }

    /// Crash count inside the current breaker window.
    pub fn crash_count(&self) -> u32 {
        self.lock_breaker().failure_count()
    }

    /// Latency of the last successful warm-up call, if one has completed.
    pub async fn warmup_latency_ms(&self) -> Option<u64> {
        self.runtime.lock().await.warmup_latency_ms
    }

    /// The `/models` listing.
    pub async fn models(&self) -> Vec<ModelInfo> {
        self.catalog.lock().await.list()
    }

    /// The active model id.
    pub async fn active_model(&self) -> String {
        self.catalog.lock().await.active().to_string()
    }

    /// Operator reset of the crash breaker.
    pub fn reset_breaker(&self) {
        self.lock_breaker().reset();
        info!("vlm crash breaker reset by operator");
    }

    /// Supervision loop. Runs until cancelled, then stops the child.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.shutdown().await;
                    return;
                }
                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    self.tick().await;
                }
            }
        }
    }

    /// One supervision step: crash detection, probe accounting, idle hold,
    /// and backoff-gated restart.
    pub async fn tick(self: &Arc<Self>) {
        let phase = self.phase();
        match phase {
            Phase::Off => {
                let should_start = {
                    let runtime = self.runtime.lock().await;
                    runtime.want_running
                        && !runtime.startup_in_flight
                        && runtime
                            .backoff_until
                            .map(|t| Instant::now() >= t)
                            .unwrap_or(true)
                };
                if should_start && !self.lock_breaker().is_tripped() {
                    self.begin_startup().await;
                }
            }
            Phase::Starting | Phase::Stopping => {}
            Phase::Ready | Phase::IdleHold => {
                // Child death is a crash regardless of idle state.
                let exited = {
                    let mut runtime = self.runtime.lock().await;
                    runtime
                        .process
                        .as_mut()
                        .and_then(|p| p.try_exit_code())
                };
                if let Some(code) = exited {
                    self.handle_crash(&format!("server exited unexpectedly (code {code})"))
                        .await;
                    return;
                }

                if phase == Phase::Ready {
                    // Probe at the tick cadence; a run of failures is a crash.
                    let healthy = self.client.read().await.check_health().await;
                    let mut runtime = self.runtime.lock().await;
                    if healthy {
                        runtime.probe_failures = 0;
                    } else {
                        runtime.probe_failures += 1;
                        if runtime.probe_failures >= PROBE_FAILURE_LIMIT {
                            drop(runtime);
                            self.handle_crash("health probe failed repeatedly").await;
                            return;
                        }
                    }

                    if runtime.last_chat.elapsed() >= Duration::from_secs(self.config.idle_hold_secs)
                    {
                        drop(runtime);
                        self.set_phase(Phase::IdleHold);
                        info!("vlm idle, holding process without accepting frames");
                    }
                }
            }
        }
    }

    /// Bring the server to `Ready` (or report why it cannot be).
    ///
    /// `Ready` is also returned from `IdleHold`: the next chat resumes the
    /// held process without a re-warm.
    pub async fn ensure_ready(&self) -> Readiness {
        if self.lock_breaker().is_tripped() {
            return Readiness::Failed("BLOCKED".into());
        }

        {
            let mut runtime = self.runtime.lock().await;
            runtime.want_running = true;
        }

        match self.phase() {
            Phase::Ready | Phase::IdleHold => return Readiness::Ready,
            Phase::Off => {
                // Start eagerly instead of waiting for the next tick.
                let can_start = {
                    let runtime = self.runtime.lock().await;
                    !runtime.startup_in_flight
                        && runtime
                            .backoff_until
                            .map(|t| Instant::now() >= t)
                            .unwrap_or(true)
                };
                if can_start {
                    self.start_and_warm().await;
                }
            }
            Phase::Starting | Phase::Stopping => {}
        }

        // Wait out the warm-up deadline for the phase to settle.
        let deadline = Duration::from_secs(self.config.warmup_deadline_secs);
        let mut rx = self.phase_tx.subscribe();
        let result = tokio::time::timeout(
            deadline,
            rx.wait_for(|p| matches!(*p, Phase::Ready | Phase::IdleHold | Phase::Off)),
        )
        .await;

        match result {
            Ok(Ok(phase)) if matches!(*phase, Phase::Ready | Phase::IdleHold) => Readiness::Ready,
            Ok(_) => {
                if self.lock_breaker().is_tripped() {
                    Readiness::Failed("BLOCKED".into())
                } else {
                    Readiness::Failed("server failed to become ready".into())
                }
            }
            Err(_) => Readiness::Starting,
        }
    }

    /// Send a chat request, driving the process to readiness first.
    ///
    /// Connection failures after the client's retry budget are treated as a
    /// crash signal; timeouts leave the process intact.
    pub async fn chat(&self, request: &ChatRequest, timeout: Duration) -> Result<String, IrisError> {
        match self.ensure_ready().await {
            Readiness::Ready => {}
            Readiness::Starting => {
                return Err(IrisError::VlmUnreachable("server still starting".into()))
            }
            Readiness::Failed(reason) if reason == "BLOCKED" => {
                return Err(IrisError::Blocked("vlm circuit breaker open".into()))
            }
            Readiness::Failed(reason) => return Err(IrisError::VlmUnreachable(reason)),
        }

        if self.phase() == Phase::IdleHold {
            self.set_phase(Phase::Ready);
        }
        {
            let mut runtime = self.runtime.lock().await;
            runtime.last_chat = Instant::now();
        }

        let result = self.client.read().await.chat(request, timeout).await;

        match &result {
            Ok(_) => {
                let mut runtime = self.runtime.lock().await;
                runtime.last_chat = Instant::now();
            }
            Err(IrisError::VlmUnreachable(reason)) => {
                let reason = reason.clone();
                self.handle_crash(&format!("chat connection failed: {reason}"))
                    .await;
            }
            Err(_) => {}
        }
        result
    }

    /// Move a ready process to idle hold without stopping it.
    pub async fn release(&self) {
        if self.phase() == Phase::Ready {
            self.set_phase(Phase::IdleHold);
        }
    }

    /// Switch the active model. Refused while a task is running.
    pub async fn switch_model(&self, model_id: &str) -> Result<(), IrisError> {
        if self.task_running.load(Ordering::Acquire) {
            return Err(IrisError::Busy);
        }
        let _guard = self.switch_lock.lock().await;

        {
            let mut catalog = self.catalog.lock().await;
            catalog.set_active(model_id)?;
        }
        self.client.write().await.set_model(model_id);
        info!(model = model_id, "switching vlm model");

        // Stopping -> Off -> Starting with the new profile.
        self.stop_process().await;
        {
            let mut runtime = self.runtime.lock().await;
            runtime.want_running = true;
            runtime.backoff_until = None;
            runtime.crash_streak = 0;
        }
        self.start_and_warm().await;

        match self.phase() {
            Phase::Ready => Ok(()),
            _ => Err(IrisError::VlmUnreachable(format!(
                "model {model_id:?} failed to start"
            ))),
        }
    }

    /// Stop the child and stay off until the next `ensure_ready`.
    pub async fn shutdown(&self) {
        {
            let mut runtime = self.runtime.lock().await;
            runtime.want_running = false;
        }
        self.stop_process().await;
    }

    // -- internals ---------------------------------------------------------

    fn lock_breaker(&self) -> std::sync::MutexGuard<'_, CircuitBreaker> {
        match self.breaker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_phase(&self, phase: Phase) {
        let changed = {
            let current = *self.phase_tx.borrow();
            current != phase
        };
        if changed {
            let _ = self.phase_tx.send(phase);
            self.bus
                .publish(Event::vlm_status(phase.as_vlm_status(), None));
        }
    }

    /// Spawn the child and mark startup in flight (non-blocking part).
    async fn begin_startup(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.start_and_warm().await;
        });
    }

    /// Full startup: spawn, probe until healthy, warm up. Blocking variant
    /// used by `ensure_ready` and `switch_model`.
    async fn start_and_warm(&self) {
        {
            let mut runtime = self.runtime.lock().await;
            if runtime.startup_in_flight || runtime.process.is_some() {
                return;
            }
            runtime.startup_in_flight = true;
        }

        let started = self.spawn_child().await;
        match started {
            Ok(()) => {
                self.set_phase(Phase::Starting);
                if let Err(reason) = self.probe_and_warm().await {
                    self.finish_startup().await;
                    self.handle_crash(&reason).await;
                    return;
                }
                {
                    let mut runtime = self.runtime.lock().await;
                    runtime.crash_streak = 0;
                    runtime.probe_failures = 0;
                    runtime.last_chat = Instant::now();
                }
                self.finish_startup().await;
                self.set_phase(Phase::Ready);
                info!("vlm server ready");
            }
            Err(e) => {
                self.finish_startup().await;
                self.handle_crash(&format!("spawn failed: {e}")).await;
            }
        }
    }

    async fn finish_startup(&self) {
        let mut runtime = self.runtime.lock().await;
        runtime.startup_in_flight = false;
    }

    async fn spawn_child(&self) -> Result<(), IrisError> {
        let (profile, model_file, mmproj_file) = {
            let catalog = self.catalog.lock().await;
            let profile = catalog
                .active_profile()
                .cloned()
                .ok_or_else(|| IrisError::Config("no active model profile".into()))?;
            let model_file = catalog.resolve(&profile.model_file);
            let mmproj_file = catalog.resolve(&profile.mmproj_file);
            (profile, model_file, mmproj_file)
        };

        let process = VlmProcess::spawn(
            &self.config,
            &profile,
            &model_file,
            &mmproj_file,
            &self.log_path,
        )?;

        let mut runtime = self.runtime.lock().await;
        runtime.process = Some(process);
        Ok(())
    }

    /// Probe `/health` at 250 ms until healthy, then run the warm-up chat.
    async fn probe_and_warm(&self) -> Result<(), String> {
        let deadline = Instant::now() + Duration::from_secs(self.config.warmup_deadline_secs);

        loop {
            if Instant::now() >= deadline {
                return Err("warm-up deadline elapsed".into());
            }
            {
                let mut runtime = self.runtime.lock().await;
                if let Some(code) = runtime.process.as_mut().and_then(|p| p.try_exit_code()) {
                    return Err(format!("server exited during startup (code {code})"));
                }
            }
            if self.client.read().await.check_health().await {
                break;
            }
            tokio::time::sleep(STARTUP_PROBE_INTERVAL).await;
        }

        // One trivial completion proves the model is loaded end to end.
        let request = ChatRequest {
            messages: vec![crate::client::PromptMessage::user(WARMUP_PROMPT)],
            image_base64: None,
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        let warm_start = Instant::now();
        self.client
            .read()
            .await
            .chat(&request, remaining.max(Duration::from_secs(5)))
            .await
            .map_err(|e| format!("warm-up chat failed: {e}"))?;

        let latency = warm_start.elapsed().as_millis() as u64;
        let mut runtime = self.runtime.lock().await;
        runtime.warmup_latency_ms = Some(latency);
        info!(latency_ms = latency, "vlm warm-up complete");
        Ok(())
    }

    async fn stop_process(&self) {
        let process = {
            let mut runtime = self.runtime.lock().await;
            runtime.process.take()
        };
        if let Some(process) = process {
            self.set_phase(Phase::Stopping);
            process
                .terminate(Duration::from_secs(self.config.stop_grace_secs))
                .await;
        }
        self.set_phase(Phase::Off);
    }

    /// Record a crash: emit, count, back off, and return to `Off` so the
    /// supervision loop restarts when the backoff elapses.
    async fn handle_crash(&self, reason: &str) {
        warn!(reason, "vlm crashed");
        self.bus.publish(Event::vlm_status(
            VlmStatus::Offline,
            Some(format!("crash: {reason}")),
        ));

        let tripped = self.lock_breaker().record_failure();
        if tripped {
            warn!("vlm crash breaker tripped, refusing restarts");
        }

        let mut runtime = self.runtime.lock().await;
        if let Some(process) = runtime.process.take() {
            // Reap whatever is left without waiting out the full grace.
            drop(process);
        }
        let delay = backoff_delay(runtime.crash_streak);
        runtime.crash_streak += 1;
        runtime.probe_failures = 0;
        runtime.backoff_until = Some(Instant::now() + delay);
        drop(runtime);

        let _ = self.phase_tx.send(Phase::Off);
        info!(delay_secs = delay.as_secs(), "vlm restart scheduled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use iris_types::ModelProfileConfig;

    fn test_manager() -> Arc<VlmManager> {
        let tmp = std::env::temp_dir();
        let mut profiles = BTreeMap::new();
        profiles.insert(
            "m".to_string(),
            ModelProfileConfig {
                display_name: "M".into(),
                model_file: "missing.gguf".into(),
                mmproj_file: "missing-mmproj.gguf".into(),
                context_size: 1024,
                gpu_layers: 0,
                available: true,
            },
        );
        let config = VlmConfig {
            active_model: "m".into(),
            profiles,
            warmup_deadline_secs: 1,
            ..VlmConfig::default()
        };
        VlmManager::new(
            config,
            tmp.clone(),
            tmp.join("iris-test-vlm.log"),
            EventBus::new(16),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(4), Duration::from_secs(16));
        assert_eq!(backoff_delay(5), Duration::from_secs(30));
        assert_eq!(backoff_delay(12), Duration::from_secs(30));
    }

    #[test]
    fn phase_maps_to_vlm_status() {
        assert_eq!(Phase::Off.as_vlm_status(), VlmStatus::Offline);
        assert_eq!(Phase::Starting.as_vlm_status(), VlmStatus::Starting);
        assert_eq!(Phase::Ready.as_vlm_status(), VlmStatus::Ready);
        assert_eq!(Phase::IdleHold.as_vlm_status(), VlmStatus::IdleHold);
        assert_eq!(Phase::Stopping.as_vlm_status(), VlmStatus::Stopping);
    }

    #[tokio::test]
    async fn ensure_ready_reports_blocked_when_tripped() {
        let manager = test_manager();
        for _ in 0..3 {
            manager.lock_breaker().record_failure();
        }
        assert_eq!(
            manager.ensure_ready().await,
            Readiness::Failed("BLOCKED".into())
        );
    }

    #[tokio::test]
    async fn switch_model_refused_while_task_running() {
        let manager = test_manager();
        manager.task_running.store(true, Ordering::Release);
        match manager.switch_model("m").await {
            Err(IrisError::Busy) => {}
            other => panic!("expected Busy, got {other:?}"),
        }
        // No lifecycle state was touched.
        assert_eq!(manager.phase(), Phase::Off);
    }

    #[tokio::test]
    async fn switch_model_rejects_unknown_profile() {
        let manager = test_manager();
        assert!(manager.switch_model("ghost").await.is_err());
        assert_eq!(manager.active_model().await, "m");
    }

    #[tokio::test]
    async fn crash_emits_offline_and_schedules_backoff() {
        let manager = test_manager();
        let sub = manager.bus.subscribe();
        manager.handle_crash("test crash").await;

        let event = sub.try_recv().expect("offline event published");
        match event.payload {
            iris_types::EventPayload::Status {
                vlm_status,
                details,
                ..
            } => {
                assert_eq!(vlm_status, Some(VlmStatus::Offline));
                assert!(details.unwrap().contains("crash"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(manager.crash_count(), 1);

        let runtime = manager.runtime.lock().await;
        assert!(runtime.backoff_until.is_some());
        assert_eq!(runtime.crash_streak, 1);
    }

    #[tokio::test]
    async fn third_crash_trips_breaker() {
        let manager = test_manager();
        for _ in 0..3 {
            manager.handle_crash("boom").await;
        }
        assert_eq!(
            manager.ensure_ready().await,
            Readiness::Failed("BLOCKED".into())
        );

        manager.reset_breaker();
        assert_ne!(
            manager.ensure_ready().await,
            Readiness::Failed("BLOCKED".into())
        );
    }

    #[tokio::test]
    async fn release_only_affects_ready() {
        let manager = test_manager();
        manager.release().await;
        assert_eq!(manager.phase(), Phase::Off);
    }
}
