//! The perception-action control loop.
//!
//! One logical execution context drives a task: capture -> think -> parse ->
//! safety gate -> act -> verify, up to the iteration cap. External inputs
//! (task, steer, pause, resume, stop, clear) arrive over a command queue and
//! are honored at step boundaries; stop additionally cancels in-flight
//! capture, chat, actuator, and delay awaits through a cancellation token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Timelike;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use iris_bus::EventBus;
use iris_types::{
    ActionEnvelope, ActionKind, AgentStatus, ChatMessage, ChatRole, Event, EventPayload,
    IrisError, SafetyConfig, Task, TaskState,
};
use iris_vlm::{ChatRequest, PromptMessage};

use crate::actuator::Actuator;
use crate::coords::{self, Calibration};
use crate::parse;
use crate::prompt;
use crate::session::{ActionHistory, ActionOutcome, ActionRecord, ConversationHistory};

/// Screen capture deadline.
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(2);

/// Actuator apply deadline.
const APPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a terminal status stays visible before the snapshot returns
/// to idle.
const TERMINAL_DWELL: Duration = Duration::from_secs(3);

/// Command queue depth.
const COMMAND_QUEUE: usize = 32;

/// The orchestrator's view of the VLM: one cancellable chat call.
///
/// [`iris_vlm::VlmManager`] is the production implementation; tests script
/// their own.
#[async_trait]
pub trait VlmLink: Send + Sync {
    async fn chat(&self, request: ChatRequest, timeout: Duration) -> Result<String, IrisError>;
}

#[async_trait]
impl VlmLink for iris_vlm::VlmManager {
    async fn chat(&self, request: ChatRequest, timeout: Duration) -> Result<String, IrisError> {
        iris_vlm::VlmManager::chat(self, &request, timeout).await
    }
}

/// External inputs to the control loop.
enum Command {
    Task {
        command: String,
        reply: oneshot::Sender<Result<Task, IrisError>>,
    },
    Steer { context: String },
    Pause,
    Resume,
    Stop,
    ClearChat,
}

/// Cloneable handle the gateway uses to drive the orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<Command>,
    running: Arc<AtomicBool>,
}

impl OrchestratorHandle {
    /// Submit a task. Refused with `Busy` while another task is running.
    pub async fn submit_task(&self, command: impl Into<String>) -> Result<Task, IrisError> {
        if self.is_running() {
            return Err(IrisError::Busy);
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Task {
                command: command.into(),
                reply,
            })
            .await
            .map_err(|_| IrisError::Cancelled)?;
        rx.await.map_err(|_| IrisError::Cancelled)?
    }

    /// Queue a steering hint for the next prompt boundary.
    pub async fn steer(&self, context: impl Into<String>) -> Result<(), IrisError> {
        self.send(Command::Steer {
            context: context.into(),
        })
        .await
    }

    pub async fn pause(&self) -> Result<(), IrisError> {
        self.send(Command::Pause).await
    }

    pub async fn resume(&self) -> Result<(), IrisError> {
        self.send(Command::Resume).await
    }

    /// Cancel the running task (no-op when idle).
    pub async fn stop(&self) -> Result<(), IrisError> {
        self.send(Command::Stop).await
    }

    pub async fn clear_chat(&self) -> Result<(), IrisError> {
        self.send(Command::ClearChat).await
    }

    /// Whether a task is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    async fn send(&self, command: Command) -> Result<(), IrisError> {
        self.tx.send(command).await.map_err(|_| IrisError::Cancelled)
    }
}

/// Mid-task control state shared between the command pump and the loop.
struct ControlState {
    paused: AtomicBool,
    resume_notify: Notify,
    steer: std::sync::Mutex<Vec<String>>,
    status_before_pause: std::sync::Mutex<AgentStatus>,
}

impl ControlState {
    fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
            resume_notify: Notify::new(),
            steer: std::sync::Mutex::new(Vec::new()),
            status_before_pause: std::sync::Mutex::new(AgentStatus::Thinking),
        }
    }

    fn queue_steer(&self, context: String) {
        match self.steer.lock() {
            Ok(mut steer) => steer.push(context),
            Err(poisoned) => poisoned.into_inner().push(context),
        }
    }

    fn take_steer(&self) -> Vec<String> {
        match self.steer.lock() {
            Ok(mut steer) => std::mem::take(&mut *steer),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    async fn wait_if_paused(&self, cancel: &CancellationToken) -> Result<(), IrisError> {
        while self.paused.load(Ordering::Acquire) {
            let notified = self.resume_notify.notified();
            if !self.paused.load(Ordering::Acquire) {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(IrisError::Cancelled),
                _ = notified => {}
            }
        }
        Ok(())
    }
}

/// Everything the loop body needs, shareable with the driver future.
struct LoopCtx {
    vlm: Arc<dyn VlmLink>,
    actuator: Arc<dyn Actuator>,
    bus: EventBus,
    safety: SafetyConfig,
    chat_timeout: Duration,
    conversation: Mutex<ConversationHistory>,
}

/// The control loop worker. Construct with [`Orchestrator::new`], then run
/// [`Orchestrator::run`] on its own tokio task.
pub struct Orchestrator {
    ctx: Arc<LoopCtx>,
    rx: mpsc::Receiver<Command>,
    running: Arc<AtomicBool>,
    pending_steer: Vec<String>,
}

impl Orchestrator {
    pub fn new(
        vlm: Arc<dyn VlmLink>,
        actuator: Arc<dyn Actuator>,
        bus: EventBus,
        safety: SafetyConfig,
        chat_timeout: Duration,
        conversation_limit: usize,
        running: Arc<AtomicBool>,
    ) -> (Self, OrchestratorHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let handle = OrchestratorHandle {
            tx,
            running: Arc::clone(&running),
        };
        let orchestrator = Self {
            ctx: Arc::new(LoopCtx {
                vlm,
                actuator,
                bus,
                safety,
                chat_timeout,
                conversation: Mutex::new(ConversationHistory::new(conversation_limit)),
            }),
            rx,
            running,
            pending_steer: Vec::new(),
        };
        (orchestrator, handle)
    }

    /// Consume commands until cancelled or all handles are dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let command = tokio::select! {
                _ = cancel.cancelled() => return,
                command = self.rx.recv() => match command {
                    Some(command) => command,
                    None => return,
                },
            };

            match command {
                Command::Task { command, reply } => {
                    if self.running.load(Ordering::Acquire) {
                        let _ = reply.send(Err(IrisError::Busy));
                        continue;
                    }
                    let mut task = Task::new(command);
                    task.state = TaskState::Running;
                    info!(task_id = %task.id, command = task.command, "task started");
                    let _ = reply.send(Ok(task.clone()));

                    self.running.store(true, Ordering::Release);
                    self.drive_task(task, &cancel).await;
                    self.running.store(false, Ordering::Release);
                }
                Command::Steer { context } => {
                    // Idle steer becomes context for the next task.
                    self.pending_steer.push(context);
                }
                Command::ClearChat => {
                    self.ctx.conversation.lock().await.clear();
                    self.ctx.bus.snapshot_cell().clear_chat();
                }
                // Pause, resume, and stop are meaningless without a task.
                Command::Pause | Command::Resume | Command::Stop => {}
            }
        }
    }

    /// Run one task while continuing to pump commands.
    async fn drive_task(&mut self, task: Task, cancel: &CancellationToken) {
        let task_cancel = cancel.child_token();
        let ctl = Arc::new(ControlState::new());
        for hint in self.pending_steer.drain(..) {
            ctl.queue_steer(hint);
        }

        {
            let mut conversation = self.ctx.conversation.lock().await;
            conversation.push(ChatRole::User, task.command.clone());
        }
        self.ctx.bus.publish(Event::new(EventPayload::ChatMessage(
            ChatMessage::user(task.command.clone()),
        )));

        let ctx = Arc::clone(&self.ctx);
        let loop_ctl = Arc::clone(&ctl);
        let loop_cancel = task_cancel.clone();
        let mut task_future =
            Box::pin(async move { ctx.execute_task(task, loop_ctl, loop_cancel).await });

        loop {
            tokio::select! {
                _ = &mut task_future => break,
                command = self.rx.recv() => match command {
                    Some(command) => self.handle_mid_task(command, &ctl, &task_cancel).await,
                    None => {
                        task_cancel.cancel();
                        task_future.await;
                        break;
                    }
                }
            }
        }

        // Let observers see the terminal status briefly, then return to idle.
        let bus = self.ctx.bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(TERMINAL_DWELL).await;
            if bus.snapshot_cell().status_is_terminal() {
                bus.snapshot_cell().reset_to_idle();
            }
        });
    }

    async fn handle_mid_task(
        &self,
        command: Command,
        ctl: &ControlState,
        task_cancel: &CancellationToken,
    ) {
        match command {
            Command::Task { reply, .. } => {
                let _ = reply.send(Err(IrisError::Busy));
            }
            Command::Steer { context } => {
                info!(context, "steer queued for next prompt");
                self.ctx
                    .bus
                    .publish(Event::thought(format!("Steering noted: {context}")));
                ctl.queue_steer(context);
            }
            Command::Pause => {
                if !ctl.paused.swap(true, Ordering::AcqRel) {
                    let current = self.ctx.bus.snapshot_cell().snapshot().status;
                    if let Ok(mut prev) = ctl.status_before_pause.lock() {
                        *prev = current;
                    }
                    self.ctx
                        .bus
                        .publish(Event::status(AgentStatus::Paused, Some("Paused by user".into())));
                }
            }
            Command::Resume => {
                if ctl.paused.swap(false, Ordering::AcqRel) {
                    let prev = ctl
                        .status_before_pause
                        .lock()
                        .map(|s| *s)
                        .unwrap_or(AgentStatus::Thinking);
                    self.ctx.bus.publish(Event::status(prev, None));
                    ctl.resume_notify.notify_waiters();
                }
            }
            Command::Stop => {
                info!("stop requested, cancelling task");
                task_cancel.cancel();
                // A paused loop must wake to observe the cancellation.
                ctl.paused.store(false, Ordering::Release);
                ctl.resume_notify.notify_waiters();
            }
            Command::ClearChat => {
                self.ctx.conversation.lock().await.clear();
                self.ctx.bus.snapshot_cell().clear_chat();
            }
        }
    }
}

impl LoopCtx {
    /// The per-task loop. Always publishes exactly one terminal status.
    async fn execute_task(
        &self,
        mut task: Task,
        ctl: Arc<ControlState>,
        cancel: CancellationToken,
    ) {
        let calibration = Calibration {
            offset_x: self.safety.click_offset_x,
            offset_y: self.safety.click_offset_y,
        };

        let (width, height) = match self.actuator.screen_size().await {
            Ok(size) => size,
            Err(e) => {
                self.finish(&mut task, TaskState::Error, format!("screen size unavailable: {e}"));
                return;
            }
        };

        let mut history = ActionHistory::new();
        let mut last_error: Option<String> = None;

        for step in 1..=self.safety.max_iterations {
            if cancel.is_cancelled() {
                self.finish(&mut task, TaskState::Aborted, "Stopped by user".into());
                return;
            }
            if ctl.wait_if_paused(&cancel).await.is_err() {
                self.finish(&mut task, TaskState::Aborted, "Stopped by user".into());
                return;
            }

            // Capture.
            self.publish_status(AgentStatus::Capturing, None);
            let frame = match self.capture_with_retry(&cancel).await {
                Ok(frame) => Arc::new(frame),
                Err(IrisError::Cancelled) => {
                    self.finish(&mut task, TaskState::Aborted, "Stopped by user".into());
                    return;
                }
                Err(e) => {
                    self.finish(&mut task, TaskState::Error, format!("capture failed: {e}"));
                    return;
                }
            };
            self.bus.publish(Event::frame(Arc::clone(&frame)));

            // Think.
            self.publish_status(AgentStatus::Thinking, None);
            let prompt_text = self
                .build_prompt(&task, step, width, height, &ctl, &history, &last_error)
                .await;
            let request = ChatRequest {
                messages: prompt_text,
                image_base64: Some(frame.to_base64().to_string()),
            };

            task.iterations_used = step;
            let raw = tokio::select! {
                _ = cancel.cancelled() => {
                    self.finish(&mut task, TaskState::Aborted, "Stopped by user".into());
                    return;
                }
                result = self.vlm.chat(request, self.chat_timeout) => result,
            };

            let raw = match raw {
                Ok(raw) => raw,
                Err(IrisError::VlmTimeout { seconds }) => {
                    self.notice(format!("VLM_TIMEOUT: no reply within {seconds}s"));
                    last_error = Some("The previous model call timed out.".into());
                    continue;
                }
                Err(e) => {
                    self.finish(&mut task, TaskState::Error, format!("vlm failed: {e}"));
                    return;
                }
            };

            if let Some(text) = parse::display_thought(&raw) {
                self.bus.publish(Event::thought(text));
            }

            let envelope = match parse::parse(&raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    self.notice(format!("PARSE_ERROR: {e}"));
                    last_error =
                        Some("The reply had no valid action. Respond with exactly one json action block.".into());
                    continue;
                }
            };

            // Terminal envelopes.
            match &envelope.kind {
                ActionKind::Done => {
                    self.record_assistant(&envelope.rationale).await;
                    self.finish(&mut task, TaskState::Done, terminal_details(&envelope, "Task complete"));
                    return;
                }
                ActionKind::Fail => {
                    self.record_assistant(&envelope.rationale).await;
                    self.finish(
                        &mut task,
                        TaskState::Error,
                        terminal_details(&envelope, "Model reported failure"),
                    );
                    return;
                }
                _ => {}
            }

            // Safety gates. Equality with the threshold passes.
            if envelope.confidence < self.safety.confidence_threshold {
                self.bus.publish(Event::status(
                    AgentStatus::Blocked,
                    Some(format!(
                        "LOW_CONFIDENCE: {:.2} below threshold {:.2}",
                        envelope.confidence, self.safety.confidence_threshold
                    )),
                ));
                last_error = Some(format!(
                    "Your last action was skipped: confidence {:.2} was too low.",
                    envelope.confidence
                ));
                continue;
            }
            if !self.action_permitted(&envelope.kind) {
                self.bus.publish(Event::status(
                    AgentStatus::Blocked,
                    Some(format!("ACTION_NOT_PERMITTED: {}", envelope.kind.name())),
                ));
                last_error = Some(format!(
                    "The action {} is not permitted on this machine.",
                    envelope.kind.name()
                ));
                continue;
            }
            if self.actuator.failsafe_tripped().await {
                self.finish(&mut task, TaskState::Aborted, "Failsafe triggered".into());
                return;
            }

            // Repetition forces a strategy change next round.
            let repeats = history.repeat_count(envelope.kind.name(), &envelope.target_description);
            if repeats >= 2 {
                warn!(
                    action = envelope.kind.name(),
                    target = envelope.target_description,
                    repeats,
                    "repeating action detected"
                );
                last_error = Some(prompt::recovery_hint(
                    &format!("{} on {}", envelope.kind.name(), envelope.target_description),
                    repeats,
                ));
            }

            // Execute.
            let Some((pixel, clamped)) =
                coords::resolve(&envelope.kind, width, height, calibration)
            else {
                continue;
            };
            if clamped {
                self.notice("coordinates out of range, clamped to screen bounds".into());
            }

            self.publish_status(AgentStatus::Executing, None);
            self.bus.publish(Event::action(
                envelope.kind.name(),
                envelope.target_description.clone(),
            ));

            match self.apply_with_retry(&pixel, &cancel).await {
                Ok(()) => {}
                Err(IrisError::Cancelled) => {
                    self.finish(&mut task, TaskState::Aborted, "Stopped by user".into());
                    return;
                }
                Err(e) => {
                    history.push(ActionRecord {
                        action: envelope.kind.name().into(),
                        target: envelope.target_description.clone(),
                        position: pixel.position(),
                        outcome: ActionOutcome::Failed(e.to_string()),
                    });
                    self.finish(&mut task, TaskState::Error, format!("actuator failed: {e}"));
                    return;
                }
            }

            let delay = Duration::from_millis(self.safety.post_action_delay_ms);
            if cancel
                .run_until_cancelled(tokio::time::sleep(delay))
                .await
                .is_none()
            {
                self.finish(&mut task, TaskState::Aborted, "Stopped by user".into());
                return;
            }

            // Verify.
            self.publish_status(AgentStatus::Verifying, None);
            history.push(ActionRecord {
                action: envelope.kind.name().into(),
                target: envelope.target_description.clone(),
                position: pixel.position(),
                outcome: ActionOutcome::Executed,
            });
            self.record_assistant(&envelope.rationale).await;
            if repeats < 2 {
                last_error = None;
            }
        }

        self.finish(&mut task, TaskState::Aborted, "MAX_ITERATIONS".into());
    }

    /// Assemble the message list for one planning call.
    async fn build_prompt(
        &self,
        task: &Task,
        step: u32,
        width: u32,
        height: u32,
        ctl: &ControlState,
        history: &ActionHistory,
        last_error: &Option<String>,
    ) -> Vec<PromptMessage> {
        let mut context_lines = vec![
            format!("Screen: {width}x{height}"),
            format!("Step: {step}/{}", self.safety.max_iterations),
            prompt::time_of_day_context(chrono::Local::now().hour() as u8),
        ];
        if let Some(error) = last_error {
            context_lines.push(format!("Previous issue: {error}"));
        }
        for hint in ctl.take_steer() {
            context_lines.push(format!("User guidance (priority): {hint}"));
        }

        let plan = prompt::plan_prompt(
            &task.command,
            &context_lines.join("\n"),
            &history.render_for_prompt(),
        );

        let mut messages = vec![PromptMessage::system(prompt::SYSTEM_PROMPT)];
        let conversation = self.conversation.lock().await;
        for (role, text) in conversation.recent() {
            messages.push(PromptMessage {
                role,
                text,
            });
        }
        drop(conversation);
        messages.push(PromptMessage::user(plan));
        messages
    }

    async fn capture_once(
        &self,
        cancel: &CancellationToken,
    ) -> Result<iris_types::ScreenFrame, IrisError> {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(IrisError::Cancelled),
            result = tokio::time::timeout(CAPTURE_TIMEOUT, self.actuator.capture()) => result,
        };
        match result {
            Ok(inner) => inner,
            Err(_) => Err(IrisError::Actuator("capture timed out".into())),
        }
    }

    async fn capture_with_retry(
        &self,
        cancel: &CancellationToken,
    ) -> Result<iris_types::ScreenFrame, IrisError> {
        match self.capture_once(cancel).await {
            Ok(frame) => Ok(frame),
            Err(IrisError::Cancelled) => Err(IrisError::Cancelled),
            Err(e) => {
                self.notice(format!("ACTUATOR_ERROR: capture failed, retrying: {e}"));
                self.capture_once(cancel).await
            }
        }
    }

    async fn apply_once(
        &self,
        action: &crate::actuator::PixelAction,
        cancel: &CancellationToken,
    ) -> Result<(), IrisError> {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(IrisError::Cancelled),
            result = tokio::time::timeout(APPLY_TIMEOUT, self.actuator.apply(action)) => result,
        };
        match result {
            Ok(inner) => inner,
            Err(_) => Err(IrisError::Actuator("apply timed out".into())),
        }
    }

    async fn apply_with_retry(
        &self,
        action: &crate::actuator::PixelAction,
        cancel: &CancellationToken,
    ) -> Result<(), IrisError> {
        match self.apply_once(action, cancel).await {
            Ok(()) => Ok(()),
            Err(IrisError::Cancelled) => Err(IrisError::Cancelled),
            Err(e) => {
                self.notice(format!("ACTUATOR_ERROR: {e}, retrying once"));
                self.apply_once(action, cancel).await
            }
        }
    }

    fn action_permitted(&self, kind: &ActionKind) -> bool {
        self.safety.permitted_actions.is_empty()
            || self
                .safety
                .permitted_actions
                .iter()
                .any(|name| name == kind.name())
    }

    async fn record_assistant(&self, rationale: &str) {
        if rationale.is_empty() {
            return;
        }
        let mut conversation = self.conversation.lock().await;
        conversation.push(ChatRole::Assistant, rationale.to_string());
    }

    fn publish_status(&self, status: AgentStatus, details: Option<String>) {
        self.bus.publish(Event::status(status, details));
    }

    /// Details-only notice that does not change the agent status.
    fn notice(&self, details: String) {
        warn!(details, "loop notice");
        self.bus.publish(Event::new(EventPayload::Status {
            state: None,
            vlm_status: None,
            details: Some(details),
        }));
    }

    /// Publish the single terminal status for a task.
    fn finish(&self, task: &mut Task, state: TaskState, details: String) {
        task.state = state;
        let status = match state {
            TaskState::Done => AgentStatus::Done,
            TaskState::Aborted => AgentStatus::Aborted,
            _ => AgentStatus::Error,
        };
        info!(task_id = %task.id, state = %state, details, iterations = task.iterations_used, "task finished");
        if state == TaskState::Done {
            self.bus.publish(Event::new(EventPayload::ChatMessage(
                ChatMessage::assistant(details.clone()),
            )));
        }
        self.publish_status(status, Some(details));
    }
}

fn terminal_details(envelope: &ActionEnvelope, fallback: &str) -> String {
    if envelope.rationale.trim().is_empty() {
        fallback.to_string()
    } else {
        envelope.rationale.clone()
    }
}
