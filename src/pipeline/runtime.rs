//! Session runtime: one task per session, a control channel for confirmation and
//! cancellation, and a watch channel publishing the session's status.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::analysis::describe_scene;
use crate::config::RuntimeConfig;
use crate::decomposition::{Decomposer, DecompositionRequest};
use crate::error::{JournalError, PipelineError};
use crate::journal::{unix_now, JournalEntry, PlanJournal};
use crate::pipeline::session::{ConfirmationDecision, ConfirmationGate, ExecutionBundle, PipelineSession};
use crate::pipeline::PipelineStage;
use crate::planner::TrajectoryPlan;
use crate::primitives::PrimitiveRegistry;
use crate::scene::SceneState;

/// Messages a caller can send to a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
    /// Answer to a pending confirmation; ignored when none is pending.
    Confirm(bool),
    Cancel,
}

/// Snapshot published on every stage change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub session_id: u64,
    pub stage: PipelineStage,
    pub requires_confirmation: bool,
    pub awaiting_confirmation: bool,
    pub confirmation_reason: Option<String>,
    /// Set once the session has finished.
    pub final_stage: Option<PipelineStage>,
}

impl SessionStatus {
    fn of(session: &PipelineSession) -> Self {
        let payload = session.payload();
        Self {
            session_id: session.id(),
            stage: session.stage(),
            requires_confirmation: payload.requires_confirmation,
            awaiting_confirmation: payload.awaiting_confirmation,
            confirmation_reason: payload.confirmation_reason.clone(),
            final_stage: session.final_stage(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.final_stage.is_some()
    }
}

/// Input for one session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub transcript: String,
    pub scene: SceneState,
    /// Overrides the configured confirmation timeout.
    pub confirmation_timeout: Option<Duration>,
}

impl SessionRequest {
    pub fn new(transcript: impl Into<String>, scene: SceneState) -> Self {
        Self {
            transcript: transcript.into(),
            scene,
            confirmation_timeout: None,
        }
    }

    pub fn with_confirmation_timeout(mut self, timeout: Duration) -> Self {
        self.confirmation_timeout = Some(timeout);
        self
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionOutcome {
    pub session_id: u64,
    /// CONFIRMING on success, ERROR otherwise.
    pub final_stage: PipelineStage,
    pub message: String,
    #[serde(skip)]
    pub error: Option<PipelineError>,
    pub plan: Option<TrajectoryPlan>,
    pub execution: Option<ExecutionBundle>,
    pub requires_confirmation: bool,
    pub history: Vec<PipelineStage>,
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        self.final_stage == PipelineStage::Confirming
    }
}

/// Caller's side of a running session. Dropping it denies any pending confirmation.
#[derive(Debug)]
pub struct SessionHandle {
    id: u64,
    control: mpsc::Sender<SessionControl>,
    status: watch::Receiver<SessionStatus>,
    task: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// A receiver that observes every status change.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Waits until the session asks for confirmation (or finishes without asking).
    pub async fn confirmation_requested(&mut self) -> SessionStatus {
        if let Ok(status) = self
            .status
            .wait_for(|s| s.awaiting_confirmation || s.is_finished())
            .await
        {
            return status.clone();
        }
        self.status.borrow().clone()
    }

    /// Sends a confirmation answer. Fails only if the session task is gone.
    pub async fn confirm(&self, granted: bool) -> Result<(), PipelineError> {
        self.send(SessionControl::Confirm(granted)).await
    }

    pub async fn cancel(&self) -> Result<(), PipelineError> {
        self.send(SessionControl::Cancel).await
    }

    async fn send(&self, msg: SessionControl) -> Result<(), PipelineError> {
        self.control
            .send(msg)
            .await
            .map_err(|_| PipelineError::TaskFailed(format!("session {} is no longer running", self.id)))
    }

    /// Waits for the session to finish.
    pub async fn join(self) -> Result<SessionOutcome, PipelineError> {
        self.task.await.map_err(|e| PipelineError::TaskFailed(e.to_string()))
    }
}

/// Shared, read-only context for all sessions.
#[derive(Clone)]
pub struct PipelineRuntime {
    config: Arc<RuntimeConfig>,
    registry: PrimitiveRegistry,
    decomposer: Arc<dyn Decomposer>,
    journal: Option<PlanJournal>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for PipelineRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRuntime")
            .field("config", &self.config)
            .field("decomposer", &self.decomposer.name())
            .field("journal", &self.journal.is_some())
            .finish()
    }
}

impl PipelineRuntime {
    pub fn new(config: RuntimeConfig, decomposer: Arc<dyn Decomposer>) -> Self {
        Self {
            config: Arc::new(config),
            registry: PrimitiveRegistry::new(),
            decomposer,
            journal: None,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Like [`PipelineRuntime::new`], opening the journal named by `config.journal_path`.
    pub fn from_config(config: RuntimeConfig, decomposer: Arc<dyn Decomposer>) -> Result<Self, JournalError> {
        let journal = config.journal_path.as_ref().map(PlanJournal::open).transpose()?;
        let mut runtime = Self::new(config, decomposer);
        runtime.journal = journal;
        Ok(runtime)
    }

    pub fn with_journal(mut self, journal: PlanJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &PrimitiveRegistry {
        &self.registry
    }

    pub fn journal(&self) -> Option<&PlanJournal> {
        self.journal.as_ref()
    }

    /// Starts a session on its own task.
    pub fn spawn_session(&self, request: SessionRequest) -> SessionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = PipelineSession::new(id, request.scene.clone());
        let (control_tx, control_rx) = mpsc::channel(8);
        let (status_tx, status_rx) = watch::channel(SessionStatus::of(&session));

        let runtime = self.clone();
        let task = tokio::spawn(async move { runtime.run_session(session, request, control_rx, status_tx).await });

        SessionHandle {
            id,
            control: control_tx,
            status: status_rx,
            task,
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(session = session.id()))]
    async fn run_session(
        self,
        mut session: PipelineSession,
        request: SessionRequest,
        mut control: mpsc::Receiver<SessionControl>,
        status: watch::Sender<SessionStatus>,
    ) -> SessionOutcome {
        let publish = |session: &PipelineSession| {
            status.send_replace(SessionStatus::of(session));
        };

        let execution = self.drive(&mut session, &request, &mut control, &publish).await;
        let execution = match execution {
            Ok(bundle) => match session.confirm() {
                Ok(_) => Some(bundle),
                Err(e) => {
                    session.fail(e);
                    None
                }
            },
            Err(e) => {
                if session.final_stage().is_none() {
                    session.fail(e);
                }
                None
            }
        };
        publish(&session);

        let outcome = SessionOutcome {
            session_id: session.id(),
            final_stage: session.final_stage().unwrap_or(PipelineStage::Error),
            message: session.payload().message.clone().unwrap_or_default(),
            error: session.error().cloned(),
            requires_confirmation: session.payload().requires_confirmation,
            history: session.history().to_vec(),
            plan: session.take_plan(),
            execution,
        };
        self.journal_outcome(&request, &outcome);
        outcome
    }

    /// Runs the session up to EXECUTING. Any `Err` has already moved it through ERROR.
    async fn drive(
        &self,
        session: &mut PipelineSession,
        request: &SessionRequest,
        control: &mut mpsc::Receiver<SessionControl>,
        publish: &(impl Fn(&PipelineSession) + Sync),
    ) -> Result<ExecutionBundle, PipelineError> {
        session.listen(&request.transcript)?;
        publish(session);

        session.begin_decomposition()?;
        publish(session);
        let decomposition = DecompositionRequest::new(
            session.payload().transcript.clone(),
            request.scene.clone(),
            describe_scene(&request.scene),
        );
        let result = tokio::select! {
            result = self.decomposer.decompose(&decomposition) => result,
            () = until_cancelled(control) => return Err(session.cancel()),
        };
        session.accept_decomposition(result)?;

        session.analyze_scene()?;
        publish(session);

        session.plan(&self.config.safety, &self.registry)?;
        publish(session);

        // Drop confirmations sent before the gate opens; only answers to the published
        // request count.
        if cancel_requested(control) {
            return Err(session.cancel());
        }
        let gate = session.validate(&self.config)?;
        publish(session);

        if let ConfirmationGate::Required { .. } = gate {
            let timeout = request
                .confirmation_timeout
                .unwrap_or_else(|| self.config.confirmation.timeout());
            let decision = await_confirmation(control, timeout).await;
            let decision = match decision {
                Some(decision) => decision,
                None => return Err(session.cancel()),
            };
            session.resolve_confirmation(decision)?;
            publish(session);
        } else if cancel_requested(control) {
            return Err(session.cancel());
        }

        let bundle = session.execute()?;
        publish(session);
        Ok(bundle)
    }

    fn journal_outcome(&self, request: &SessionRequest, outcome: &SessionOutcome) {
        let Some(journal) = &self.journal else {
            return;
        };
        let entry = JournalEntry {
            session_id: outcome.session_id,
            timestamp: unix_now(),
            transcript: request.transcript.clone(),
            final_stage: outcome.final_stage,
            message: outcome.message.clone(),
            waypoint_count: outcome.plan.as_ref().map_or(0, |p| p.waypoints.len()),
            narration: outcome.plan.as_ref().map(|p| p.narration.clone()).unwrap_or_default(),
            requires_confirmation: outcome.requires_confirmation,
            error: outcome.error.as_ref().map(ToString::to_string),
        };
        if let Err(e) = journal.record(&entry) {
            tracing::warn!("failed to journal session {}: {e}", outcome.session_id);
        }
    }
}

/// Resolves when a cancel arrives. Early confirmations are ignored; a closed channel never
/// cancels a running decomposition.
async fn until_cancelled(control: &mut mpsc::Receiver<SessionControl>) {
    loop {
        match control.recv().await {
            Some(SessionControl::Cancel) => return,
            Some(SessionControl::Confirm(_)) => {
                tracing::debug!("ignoring confirmation with none pending");
            }
            None => std::future::pending::<()>().await,
        }
    }
}

fn cancel_requested(control: &mut mpsc::Receiver<SessionControl>) -> bool {
    while let Ok(msg) = control.try_recv() {
        if msg == SessionControl::Cancel {
            return true;
        }
    }
    false
}

/// `None` means cancelled. A dropped handle counts as denial, a timeout as
/// [`ConfirmationDecision::TimedOut`].
async fn await_confirmation(
    control: &mut mpsc::Receiver<SessionControl>,
    timeout: Duration,
) -> Option<ConfirmationDecision> {
    let wait = async {
        match control.recv().await {
            Some(SessionControl::Confirm(true)) => Some(ConfirmationDecision::Granted),
            Some(SessionControl::Confirm(false)) | None => Some(ConfirmationDecision::Denied),
            Some(SessionControl::Cancel) => None,
        }
    };
    match tokio::time::timeout(timeout, wait).await {
        Ok(decision) => decision,
        Err(_) => Some(ConfirmationDecision::TimedOut {
            after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SafetyConfig;
    use crate::decomposition::StaticDecomposer;
    use crate::primitives::test_support::tabletop;
    use crate::primitives::ActionInvocation;
    use serde_json::json;

    fn relaxed() -> RuntimeConfig {
        RuntimeConfig {
            safety: SafetyConfig {
                max_linear_velocity: 2.5,
                ..SafetyConfig::default()
            },
            ..RuntimeConfig::default()
        }
    }

    fn runtime(actions: serde_json::Value) -> PipelineRuntime {
        let actions: Vec<ActionInvocation> = serde_json::from_value(actions).unwrap();
        PipelineRuntime::new(relaxed(), Arc::new(StaticDecomposer::new(actions)))
    }

    fn pick() -> serde_json::Value {
        json!([
            {"action": "APPROACH", "params": {"target": "red_cube"}},
            {"action": "GRASP", "params": {"target": "red_cube"}}
        ])
    }

    fn pick_and_drop() -> serde_json::Value {
        json!([
            {"action": "APPROACH", "params": {"target": "red_cube"}},
            {"action": "GRASP", "params": {"target": "red_cube"}},
            {"action": "RELEASE"}
        ])
    }

    #[tokio::test]
    async fn short_plan_runs_without_confirmation() {
        let rt = runtime(pick());
        let outcome = rt
            .spawn_session(SessionRequest::new("pick up the red cube", tabletop()))
            .join()
            .await
            .unwrap();

        assert!(outcome.is_success(), "{}", outcome.message);
        assert!(!outcome.requires_confirmation);
        assert_eq!(outcome.message, "Done. Approaching red_cube. Grasping red_cube.");
        assert_eq!(outcome.execution.unwrap().waypoints.len(), 5);
        assert_eq!(outcome.history.last(), Some(&PipelineStage::Idle));
    }

    #[tokio::test]
    async fn long_plan_waits_for_confirmation() {
        let rt = runtime(pick_and_drop());
        let mut handle = rt.spawn_session(SessionRequest::new("pick it up and drop it", tabletop()));

        let status = handle.confirmation_requested().await;
        assert_eq!(status.stage, PipelineStage::Validating);
        assert!(status.awaiting_confirmation);
        assert_eq!(
            status.confirmation_reason.as_deref(),
            Some("Trajectory has 6 waypoints (threshold: 5)")
        );

        handle.confirm(true).await.unwrap();
        let outcome = handle.join().await.unwrap();
        assert!(outcome.is_success());
        assert!(outcome.requires_confirmation);
    }

    #[tokio::test]
    async fn denied_confirmation_ends_in_error() {
        let rt = runtime(pick_and_drop());
        let mut handle = rt.spawn_session(SessionRequest::new("pick it up and drop it", tabletop()));
        handle.confirmation_requested().await;
        handle.confirm(false).await.unwrap();

        let outcome = handle.join().await.unwrap();
        assert_eq!(outcome.final_stage, PipelineStage::Error);
        assert_eq!(outcome.error, Some(PipelineError::ConfirmationDenied));
        assert!(outcome.plan.is_none());
        assert!(outcome.message.starts_with("Sorry, I couldn't do that."));
    }

    #[tokio::test]
    async fn confirmation_timeout_is_denial() {
        let rt = runtime(pick_and_drop());
        let handle = rt.spawn_session(
            SessionRequest::new("pick it up and drop it", tabletop())
                .with_confirmation_timeout(Duration::from_millis(20)),
        );

        let outcome = handle.join().await.unwrap();
        assert_eq!(outcome.error, Some(PipelineError::ConfirmationTimeout(20)));
        assert!(outcome.execution.is_none());
    }

    #[tokio::test]
    async fn cancel_releases_pending_confirmation() {
        let rt = runtime(pick_and_drop());
        let mut handle = rt.spawn_session(
            SessionRequest::new("pick it up and drop it", tabletop())
                .with_confirmation_timeout(Duration::from_secs(30)),
        );
        assert!(handle.confirmation_requested().await.awaiting_confirmation);
        handle.cancel().await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("cancel must not wait out the confirmation timeout")
            .unwrap();
        assert_eq!(outcome.error, Some(PipelineError::Cancelled));
        assert!(outcome.execution.is_none());
        assert!(outcome.history.ends_with(&[PipelineStage::Validating, PipelineStage::Error, PipelineStage::Idle]));
    }

    #[tokio::test]
    async fn confirmation_sent_before_the_gate_is_ignored() {
        let rt = runtime(pick_and_drop());
        let handle = rt.spawn_session(
            SessionRequest::new("pick it up and drop it", tabletop())
                .with_confirmation_timeout(Duration::from_millis(20)),
        );
        // Queued before the session task has run at all.
        handle.confirm(true).await.unwrap();

        let outcome = handle.join().await.unwrap();
        assert_eq!(outcome.error, Some(PipelineError::ConfirmationTimeout(20)));
        assert!(outcome.execution.is_none());
    }

    #[tokio::test]
    async fn cancel_interrupts_decomposition() {
        let slow = StaticDecomposer::new(vec![]).with_delay(Duration::from_secs(30));
        let rt = PipelineRuntime::new(relaxed(), Arc::new(slow));
        let mut handle = rt.spawn_session(SessionRequest::new("wait", tabletop()));

        let mut status = handle.subscribe();
        status
            .wait_for(|s| s.stage == PipelineStage::Decomposing)
            .await
            .unwrap();
        handle.cancel().await.unwrap();

        let finished = handle.confirmation_requested().await;
        assert!(finished.is_finished());
        let outcome = handle.join().await.unwrap();
        assert_eq!(outcome.error, Some(PipelineError::Cancelled));
        assert_eq!(
            outcome.history,
            [
                PipelineStage::Idle,
                PipelineStage::Listening,
                PipelineStage::Decomposing,
                PipelineStage::Error,
                PipelineStage::Idle
            ]
        );
    }

    #[tokio::test]
    async fn sessions_are_independent() {
        let rt = runtime(pick());
        let failing = rt.spawn_session(SessionRequest::new("  ", tabletop()));
        let working = rt.spawn_session(SessionRequest::new("pick up the red cube", tabletop()));
        assert_ne!(failing.id(), working.id());

        let (failed, worked) = tokio::join!(failing.join(), working.join());
        assert_eq!(failed.unwrap().error, Some(PipelineError::EmptyTranscript));
        assert!(worked.unwrap().is_success());
    }

    #[tokio::test]
    async fn unavailable_decomposition_is_reported() {
        let rt = PipelineRuntime::new(relaxed(), Arc::new(StaticDecomposer::unavailable("offline")));
        let outcome = rt
            .spawn_session(SessionRequest::new("pick up the red cube", tabletop()))
            .join()
            .await
            .unwrap();
        assert_eq!(
            outcome.message,
            "Sorry, I couldn't do that. no decomposition provider available: offline"
        );
    }

    #[tokio::test]
    async fn finished_sessions_are_journaled() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let rt = runtime(pick()).with_journal(PlanJournal::from_db(db));

        rt.spawn_session(SessionRequest::new("pick up the red cube", tabletop()))
            .join()
            .await
            .unwrap();

        let entry = rt.journal().and_then(PlanJournal::latest).expect("entry recorded");
        assert_eq!(entry.final_stage, PipelineStage::Confirming);
        assert_eq!(entry.waypoint_count, 5);
        assert_eq!(entry.transcript, "pick up the red cube");
    }
}
