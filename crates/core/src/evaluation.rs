//! Teaching Evaluation
//!
//! Scores the human teacher's explanations through an external scoring
//! service. Evaluations run as background tasks that report back to the
//! coordinator over a channel; the orchestrator keeps the latest accepted
//! result and decides which reports are still relevant.
//!
//! Automatic evaluations follow a one-shot trigger: a human message arms it,
//! and the next finalized avatar turn disarms it and schedules one call after
//! a fixed delay.

use crate::models::TranscriptSnapshot;
use anyhow::{Context, Result};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

pub const DEFAULT_EVALUATION_DELAY: Duration = Duration::from_millis(1000);

const OUTCOME_BUFFER: usize = 16;

/// Scores for the teacher's explanations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EvaluationResult {
    #[schemars(range(min = 0, max = 100))]
    pub clarity: u32,
    #[schemars(range(min = 0, max = 100))]
    pub accuracy: u32,
    #[schemars(range(min = 0, max = 100))]
    pub engagement: u32,
    pub suggestions: Vec<String>,
    pub evidence: Vec<String>,
    pub overall_comment: String,
}

impl EvaluationResult {
    /// True once any score has been reported.
    pub fn has_scores(&self) -> bool {
        self.clarity > 0 || self.accuracy > 0 || self.engagement > 0
    }
}

/// The scoring service's response before normalization. Every field may be
/// missing and list items may be null.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawEvaluation {
    pub clarity: Option<i64>,
    pub accuracy: Option<i64>,
    pub engagement: Option<i64>,
    pub suggestions: Option<Vec<Option<String>>>,
    pub evidence: Option<Vec<Option<String>>>,
    pub overall_comment: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EvaluationError {
    #[error("Score '{metric}' out of range: {value}")]
    ScoreOutOfRange { metric: &'static str, value: i64 },
}

impl RawEvaluation {
    /// Fills defaults, drops null list items and checks every score lies in
    /// `0..=100`.
    pub fn normalize(self) -> Result<EvaluationResult, EvaluationError> {
        let score = |metric: &'static str, value: Option<i64>| {
            let value = value.unwrap_or(0);
            u32::try_from(value)
                .ok()
                .filter(|v| *v <= 100)
                .ok_or(EvaluationError::ScoreOutOfRange { metric, value })
        };
        let strings = |items: Option<Vec<Option<String>>>| -> Vec<String> {
            items.unwrap_or_default().into_iter().flatten().collect()
        };

        Ok(EvaluationResult {
            clarity: score("clarity", self.clarity)?,
            accuracy: score("accuracy", self.accuracy)?,
            engagement: score("engagement", self.engagement)?,
            suggestions: strings(self.suggestions),
            evidence: strings(self.evidence),
            overall_comment: self.overall_comment.unwrap_or_default(),
        })
    }
}

/// An external service that scores a serialized transcript.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EvaluationService: Send + Sync {
    async fn analyze(&self, transcript: &str) -> Result<RawEvaluation>;
}

/// Serializes `snapshot`, calls the scoring service, and validates the reply.
pub async fn evaluate(
    service: &dyn EvaluationService,
    snapshot: &TranscriptSnapshot,
) -> Result<EvaluationResult> {
    let transcript = snapshot.to_json()?;
    let raw = service
        .analyze(&transcript)
        .await
        .context("Evaluation service call failed")?;
    let result = raw.normalize().context("Invalid evaluation received")?;
    Ok(result)
}

/// The one-shot automatic trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoTrigger {
    #[default]
    Disarmed,
    Armed,
}

impl AutoTrigger {
    pub fn on_human_message(self) -> Self {
        AutoTrigger::Armed
    }

    /// Returns the next trigger state and whether an evaluation should fire.
    pub fn on_avatar_turn(self) -> (Self, bool) {
        match self {
            AutoTrigger::Armed => (AutoTrigger::Disarmed, true),
            AutoTrigger::Disarmed => (AutoTrigger::Disarmed, false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Automatic,
    Manual,
}

#[derive(Debug)]
pub enum EvaluationEvent {
    Started,
    Finished(Result<EvaluationResult, String>),
}

/// A report from an evaluation task. Tickets increase with every request.
#[derive(Debug)]
pub struct EvaluationMessage {
    pub ticket: u64,
    pub event: EvaluationEvent,
}

/// What the coordinator should surface after handling a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluationUpdate {
    Started,
    Updated(EvaluationResult),
    Failed(String),
}

pub struct EvaluationOrchestrator {
    service: Arc<dyn EvaluationService>,
    delay: Duration,
    trigger: AutoTrigger,
    result: EvaluationResult,
    outcomes_tx: mpsc::Sender<EvaluationMessage>,
    next_ticket: u64,
    /// Reports for tickets below this were issued before the last reset.
    floor: u64,
    /// Highest ticket whose result was applied.
    applied: Option<u64>,
    scheduled_auto: Option<(u64, JoinHandle<()>)>,
    manual: Vec<(u64, JoinHandle<()>)>,
    live: HashSet<u64>,
    running: HashSet<u64>,
}

impl EvaluationOrchestrator {
    pub fn new(
        service: Arc<dyn EvaluationService>,
        delay: Duration,
    ) -> (Self, mpsc::Receiver<EvaluationMessage>) {
        let (outcomes_tx, outcomes_rx) = mpsc::channel(OUTCOME_BUFFER);
        let orchestrator = Self {
            service,
            delay,
            trigger: AutoTrigger::default(),
            result: EvaluationResult::default(),
            outcomes_tx,
            next_ticket: 0,
            floor: 0,
            applied: None,
            scheduled_auto: None,
            manual: Vec::new(),
            live: HashSet::new(),
            running: HashSet::new(),
        };
        (orchestrator, outcomes_rx)
    }

    pub fn result(&self) -> &EvaluationResult {
        &self.result
    }

    pub fn is_evaluating(&self) -> bool {
        !self.running.is_empty()
    }

    pub fn is_armed(&self) -> bool {
        self.trigger == AutoTrigger::Armed
    }

    /// Whether an automatic evaluation is waiting on its delay or running.
    pub fn has_scheduled(&self) -> bool {
        self.scheduled_auto
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    pub fn on_human_message(&mut self) {
        self.trigger = self.trigger.on_human_message();
    }

    /// Consumes the trigger for a finalized avatar turn. When it was armed,
    /// an evaluation of `snapshot()` is scheduled after the delay and any
    /// earlier automatic evaluation still pending is superseded.
    pub fn on_avatar_turn(&mut self, snapshot: impl FnOnce() -> TranscriptSnapshot) -> bool {
        let (trigger, fire) = self.trigger.on_avatar_turn();
        self.trigger = trigger;
        if !fire {
            return false;
        }

        if let Some((ticket, handle)) = self.scheduled_auto.take() {
            debug!(ticket, "Superseding earlier automatic evaluation");
            self.cancel(ticket, &handle);
        }
        let (ticket, handle) = self.spawn(snapshot(), self.delay, Trigger::Automatic);
        self.scheduled_auto = Some((ticket, handle));
        true
    }

    /// Starts an evaluation right away. Manual evaluations may overlap with
    /// each other and with automatic ones.
    pub fn evaluate_now(&mut self, snapshot: TranscriptSnapshot) {
        self.manual.retain(|(_, handle)| !handle.is_finished());
        let task = self.spawn(snapshot, Duration::ZERO, Trigger::Manual);
        self.manual.push(task);
    }

    /// Applies a task report. Returns `None` for reports that no longer matter.
    pub fn handle(&mut self, message: EvaluationMessage) -> Option<EvaluationUpdate> {
        let ticket = message.ticket;
        if ticket < self.floor {
            debug!(ticket, "Dropping evaluation report from before reset");
            return None;
        }

        match message.event {
            EvaluationEvent::Started => {
                if !self.live.contains(&ticket) {
                    return None;
                }
                self.running.insert(ticket);
                Some(EvaluationUpdate::Started)
            }
            EvaluationEvent::Finished(outcome) => {
                self.live.remove(&ticket);
                self.running.remove(&ticket);
                match outcome {
                    Ok(_) if self.applied.is_some_and(|applied| ticket < applied) => {
                        debug!(ticket, "Dropping result older than the applied one");
                        None
                    }
                    Ok(result) => {
                        info!(
                            ticket,
                            clarity = result.clarity,
                            accuracy = result.accuracy,
                            engagement = result.engagement,
                            "Evaluation updated"
                        );
                        self.applied = Some(ticket);
                        self.result = result.clone();
                        Some(EvaluationUpdate::Updated(result))
                    }
                    Err(e) => {
                        error!(ticket, error = %e, "Evaluation failed; keeping previous result");
                        Some(EvaluationUpdate::Failed(e))
                    }
                }
            }
        }
    }

    /// Cancels scheduled and running evaluations, disarms the trigger and
    /// clears the result. Reports from earlier tasks are ignored afterwards.
    pub fn reset(&mut self) {
        if let Some((ticket, handle)) = self.scheduled_auto.take() {
            self.cancel(ticket, &handle);
        }
        for (ticket, handle) in std::mem::take(&mut self.manual) {
            self.cancel(ticket, &handle);
        }
        self.live.clear();
        self.running.clear();
        self.trigger = AutoTrigger::Disarmed;
        self.result = EvaluationResult::default();
        self.floor = self.next_ticket;
        self.applied = None;
    }

    fn cancel(&mut self, ticket: u64, handle: &JoinHandle<()>) {
        handle.abort();
        self.live.remove(&ticket);
        self.running.remove(&ticket);
    }

    fn spawn(
        &mut self,
        snapshot: TranscriptSnapshot,
        delay: Duration,
        trigger: Trigger,
    ) -> (u64, JoinHandle<()>) {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.live.insert(ticket);

        let service = self.service.clone();
        let tx = self.outcomes_tx.clone();
        let span = tracing::info_span!("evaluation", ticket, ?trigger);
        info!(ticket, ?trigger, delay_ms = delay.as_millis() as u64, "Evaluation scheduled");

        let handle = tokio::spawn(
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx
                    .send(EvaluationMessage {
                        ticket,
                        event: EvaluationEvent::Started,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
                let outcome = evaluate(service.as_ref(), &snapshot)
                    .await
                    .map_err(|e| format!("{e:#}"));
                if tx
                    .send(EvaluationMessage {
                        ticket,
                        event: EvaluationEvent::Finished(outcome),
                    })
                    .await
                    .is_err()
                {
                    warn!("Evaluation receiver dropped");
                }
            }
            .instrument(span),
        );
        (ticket, handle)
    }
}

impl Drop for EvaluationOrchestrator {
    fn drop(&mut self) {
        if let Some((_, handle)) = &self.scheduled_auto {
            handle.abort();
        }
        for (_, handle) in &self.manual {
            handle.abort();
        }
    }
}
