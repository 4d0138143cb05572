//! Conversation Coordinator
//!
//! Owns every core component and the transcript, and mutates them from a
//! single task. Network work (session sends, evaluations) runs in spawned
//! tasks that report back over channels; the coordinator's loop multiplexes
//! those reports with commands from the presentation layer and a frame
//! ticker that drives the avatar animation.

use crate::UiEvent;
use crate::action::{self, ActionTag};
use crate::animation::{AnimationStateMachine, AnimationTuning, AvatarRig, Clip};
use crate::evaluation::{
    DEFAULT_EVALUATION_DELAY, EvaluationMessage, EvaluationOrchestrator, EvaluationService,
    EvaluationUpdate,
};
use crate::models::{Topic, Transcript, TranscriptSnapshot};
use crate::prompt::{self, DEFAULT_PERSONA_PROMPT};
use crate::rate_limit::{DEFAULT_MIN_INTERVAL, RateLimiter};
use crate::session::{ConversationService, SessionEvent, SessionEventKind, SessionManager};
use crate::stream::{StreamAccumulator, TurnOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(16);
pub const DEFAULT_AVATAR_NAME: &str = "Darwin";

/// Inputs from the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start(Topic),
    ChangeTopic(Topic),
    Submit(String),
    Evaluate,
    SetQuackMode(bool),
    ClipFinished(Clip),
    SignOut,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub avatar_name: String,
    pub persona_prompt: Arc<String>,
    pub min_send_interval: Duration,
    pub evaluation_delay: Duration,
    pub frame_interval: Duration,
    pub tuning: AnimationTuning,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            avatar_name: DEFAULT_AVATAR_NAME.to_string(),
            persona_prompt: Arc::new(DEFAULT_PERSONA_PROMPT.to_string()),
            min_send_interval: DEFAULT_MIN_INTERVAL,
            evaluation_delay: DEFAULT_EVALUATION_DELAY,
            frame_interval: DEFAULT_FRAME_INTERVAL,
            tuning: AnimationTuning::default(),
        }
    }
}

/// Why a submitted message was or was not sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Sent,
    Blank,
    NoSession,
    RateLimited { retry_in: Duration },
}

pub struct ConversationCoordinator {
    sessions: SessionManager,
    session_events: mpsc::Receiver<SessionEvent>,
    accumulator: StreamAccumulator,
    animation: AnimationStateMachine,
    evaluation: EvaluationOrchestrator,
    evaluation_events: mpsc::Receiver<EvaluationMessage>,
    limiter: RateLimiter,
    transcript: Transcript,
    topic: Option<Topic>,
    quack_mode: bool,
    awaiting_response: bool,
    avatar_name: String,
    frame_interval: Duration,
    ui: mpsc::UnboundedSender<UiEvent>,
}

impl ConversationCoordinator {
    pub fn new(
        conversation: Arc<dyn ConversationService>,
        evaluator: Arc<dyn EvaluationService>,
        rig: Box<dyn AvatarRig>,
        settings: CoordinatorSettings,
        ui: mpsc::UnboundedSender<UiEvent>,
    ) -> Self {
        let (sessions, session_events) = SessionManager::new(conversation, settings.persona_prompt);
        let (evaluation, evaluation_events) =
            EvaluationOrchestrator::new(evaluator, settings.evaluation_delay);
        Self {
            sessions,
            session_events,
            accumulator: StreamAccumulator::new(),
            animation: AnimationStateMachine::new(rig, settings.tuning),
            evaluation,
            evaluation_events,
            limiter: RateLimiter::new(settings.min_send_interval),
            transcript: Transcript::new(),
            topic: None,
            quack_mode: false,
            awaiting_response: false,
            avatar_name: settings.avatar_name,
            frame_interval: settings.frame_interval,
            ui,
        }
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn topic(&self) -> Option<&Topic> {
        self.topic.as_ref()
    }

    pub fn is_awaiting_response(&self) -> bool {
        self.awaiting_response
    }

    pub fn is_quack_mode(&self) -> bool {
        self.quack_mode
    }

    pub fn animation(&self) -> &AnimationStateMachine {
        &self.animation
    }

    pub fn evaluation(&self) -> &EvaluationOrchestrator {
        &self.evaluation
    }

    /// Runs until the command channel closes.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut frames = tokio::time::interval(self.frame_interval);
        frames.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_frame = Instant::now();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        info!("Command channel closed; stopping coordinator");
                        break;
                    }
                },
                Some(event) = self.session_events.recv() => self.handle_session_event(event),
                Some(message) = self.evaluation_events.recv() => {
                    self.handle_evaluation_message(message)
                }
                _ = frames.tick() => {
                    let now = Instant::now();
                    self.tick(now.saturating_duration_since(last_frame));
                    last_frame = now;
                }
            }
        }

        self.sessions.destroy();
        self.evaluation.reset();
    }

    /// Waits for the next session or evaluation report and handles it.
    /// Returns `false` when both report channels are closed.
    pub async fn process_next(&mut self) -> bool {
        tokio::select! {
            Some(event) = self.session_events.recv() => {
                self.handle_session_event(event);
                true
            }
            Some(message) = self.evaluation_events.recv() => {
                self.handle_evaluation_message(message);
                true
            }
            else => false,
        }
    }

    pub async fn handle_command(&mut self, command: Command) {
        debug!(?command, "Handling command");
        match command {
            Command::Start(topic) | Command::ChangeTopic(topic) => self.start(topic).await,
            Command::Submit(text) => {
                self.submit(&text, Instant::now());
            }
            Command::Evaluate => {
                self.evaluate_now();
            }
            Command::SetQuackMode(enabled) => self.set_quack_mode(enabled),
            Command::ClipFinished(clip) => self.clip_finished(clip),
            Command::SignOut => self.sign_out(),
        }
    }

    /// Resets the conversation and opens a fresh session for `topic`.
    pub async fn start(&mut self, topic: Topic) {
        if self.topic.is_some() {
            info!(topic = %topic.topic, subject = %topic.subject, "Changing topic");
            self.reset_conversation();
        }
        self.topic = Some(topic.clone());

        match self.sessions.create(&topic).await {
            Ok(generation) => {
                debug!(generation, "Session ready");
                self.emit(UiEvent::SessionReady(topic));
                self.set_awaiting(true);
            }
            Err(e) => {
                error!(error = %e, "Failed to start conversation");
                self.emit(UiEvent::SessionFailed(e.to_string()));
            }
        }
    }

    /// Checks, in order: blank text, missing session, send rate. An accepted
    /// message is appended before the service confirms it and never rolled
    /// back.
    pub fn submit(&mut self, text: &str, now: Instant) -> SubmitOutcome {
        let text = text.trim();
        if text.is_empty() {
            self.emit(UiEvent::InputRejected("Message is blank".to_string()));
            return SubmitOutcome::Blank;
        }
        if !self.sessions.is_active() {
            warn!("Message submitted without an active session");
            self.emit(UiEvent::InputRejected("No active conversation".to_string()));
            return SubmitOutcome::NoSession;
        }
        if !self.limiter.allow(now) {
            let retry_in = self.limiter.retry_in(now);
            self.emit(UiEvent::RateLimited { retry_in });
            return SubmitOutcome::RateLimited { retry_in };
        }

        let message = self.transcript.push_user(text).clone();
        self.emit(UiEvent::MessageAppended(message));
        self.evaluation.on_human_message();

        if let Err(e) = self.sessions.send(text) {
            error!(error = %e, "Failed to dispatch message");
            self.emit(UiEvent::Error(e.to_string()));
            return SubmitOutcome::Sent;
        }
        self.set_awaiting(true);
        SubmitOutcome::Sent
    }

    /// Starts a manual evaluation. Skipped when there is nothing to score.
    pub fn evaluate_now(&mut self) -> bool {
        if self.transcript.is_empty() || !self.transcript.has_user_message() {
            warn!("Skipping evaluation: no teacher messages yet");
            return false;
        }
        let topic = self.topic.clone().unwrap_or_else(prompt::default_topic);
        let snapshot = TranscriptSnapshot::new(self.transcript.messages(), &topic);
        self.evaluation.evaluate_now(snapshot);
        true
    }

    pub fn set_quack_mode(&mut self, enabled: bool) {
        info!(enabled, "Quack mode toggled");
        self.quack_mode = enabled;
    }

    /// Completes a transitional clip once the renderer reports it finished.
    pub fn clip_finished(&mut self, clip: Clip) {
        debug!(?clip, "Clip finished");
        self.animation.clip_finished(clip);
    }

    /// Ends the session and clears everything tied to it.
    pub fn sign_out(&mut self) {
        info!("Signing out");
        self.sessions.destroy();
        self.reset_conversation();
        self.topic = None;
    }

    /// Advances the avatar animation by one frame.
    pub fn tick(&mut self, delta: Duration) {
        self.animation.update(delta);
    }

    pub fn handle_session_event(&mut self, event: SessionEvent) {
        if !self.sessions.is_current(&event) {
            debug!(generation = event.generation, "Dropping event from a replaced session");
            return;
        }

        match event.kind {
            SessionEventKind::Stream(stream_event) => match self.accumulator.apply(stream_event) {
                TurnOutcome::Pending => {}
                TurnOutcome::Finalized(raw) => self.on_turn_finalized(&raw),
                TurnOutcome::Discarded => self.set_awaiting(false),
                TurnOutcome::Failed(e) => {
                    error!(error = %e, "Conversation stream failed");
                    self.set_awaiting(false);
                    self.emit(UiEvent::Error(e));
                }
            },
            SessionEventKind::SendFailed(e) => {
                self.set_awaiting(false);
                self.emit(UiEvent::Error(e));
            }
        }
    }

    pub fn handle_evaluation_message(&mut self, message: EvaluationMessage) {
        let event = match self.evaluation.handle(message) {
            Some(EvaluationUpdate::Started) => UiEvent::EvaluationStarted,
            Some(EvaluationUpdate::Updated(result)) => UiEvent::EvaluationUpdated(result),
            Some(EvaluationUpdate::Failed(e)) => UiEvent::EvaluationFailed(e),
            None => return,
        };
        self.emit(event);
    }

    fn on_turn_finalized(&mut self, raw: &str) {
        let parsed = action::parse(raw);
        debug!(action = %parsed.action, "Avatar reaction");
        self.animation.request_state(parsed.action);

        let content = action::decorate(&parsed.clean, self.quack_mode);
        let message = self.transcript.push_avatar(&self.avatar_name, content).clone();
        self.emit(UiEvent::MessageAppended(message));
        self.set_awaiting(false);

        let transcript = &self.transcript;
        let topic = self.topic.clone().unwrap_or_else(prompt::default_topic);
        self.evaluation
            .on_avatar_turn(|| TranscriptSnapshot::new(transcript.messages(), &topic));
    }

    fn reset_conversation(&mut self) {
        self.transcript.clear();
        self.accumulator.reset();
        self.evaluation.reset();
        self.animation.request_state(ActionTag::Idle);
        self.set_awaiting(false);
        self.emit(UiEvent::ConversationReset);
    }

    fn set_awaiting(&mut self, awaiting: bool) {
        if self.awaiting_response != awaiting {
            self.awaiting_response = awaiting;
            self.emit(UiEvent::AwaitingResponse(awaiting));
        }
    }

    fn emit(&self, event: UiEvent) {
        if self.ui.send(event).is_err() {
            debug!("UI receiver dropped");
        }
    }
}
