//! One pipeline session as a plain state machine value.
//!
//! Every step checks its edge against the transition table before doing anything, so a
//! session can never skip validation. A failing step moves the session through ERROR back
//! to IDLE, discards in-flight plan state and leaves a plain-language message behind.

use serde::Serialize;

use crate::analysis::describe_scene;
use crate::config::{ConfirmationPolicy, RuntimeConfig, SafetyConfig};
use crate::error::{DecompositionError, PipelineError};
use crate::pipeline::{validate_transition, PipelineStage};
use crate::planner::{plan_trajectory, TrajectoryPlan};
use crate::primitives::{ActionInvocation, PrimitiveRegistry};
use crate::safety::{pair_velocities, validate_trajectory};
use crate::scene::{SceneState, Waypoint};

/// Data carried from stage to stage.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionPayload {
    pub transcript: String,
    pub scene: SceneState,
    pub scene_description: Option<String>,
    pub action_plan: Vec<ActionInvocation>,
    pub plan: Option<TrajectoryPlan>,
    pub requires_confirmation: bool,
    pub confirmation_reason: Option<String>,
    /// Set while VALIDATING waits on a human.
    pub awaiting_confirmation: bool,
    pub confirmation_granted: bool,
    pub execution_ready: bool,
    /// "Done. ..." or "Sorry, I couldn't do that. ..."
    pub message: Option<String>,
}

/// Result of the VALIDATING stage for a safe trajectory.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmationGate {
    Clear,
    Required { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationDecision {
    Granted,
    Denied,
    TimedOut { after_ms: u64 },
}

/// What EXECUTING hands to the execution collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionBundle {
    pub session_id: u64,
    pub waypoints: Vec<Waypoint>,
    pub narration: Vec<String>,
}

/// Why a safe trajectory still needs a human, if it does.
///
/// Long trajectories and fast steps both trigger the gate. When both apply, the velocity
/// reason is reported.
pub fn confirmation_requirement(
    waypoints: &[Waypoint],
    safety: &SafetyConfig,
    policy: &ConfirmationPolicy,
) -> Option<String> {
    let limit = safety.max_linear_velocity * policy.velocity_fraction;
    let fast = pair_velocities(waypoints, safety).find(|&(_, v)| v > limit);
    if let Some((i, velocity)) = fast {
        return Some(format!(
            "Waypoint {i} velocity {velocity:.2} m/s exceeds {:.0}% of max ({} m/s)",
            policy.velocity_fraction * 100.0,
            safety.max_linear_velocity
        ));
    }
    (waypoints.len() > policy.waypoint_threshold).then(|| {
        format!(
            "Trajectory has {} waypoints (threshold: {})",
            waypoints.len(),
            policy.waypoint_threshold
        )
    })
}

#[derive(Debug, Clone)]
pub struct PipelineSession {
    id: u64,
    stage: PipelineStage,
    history: Vec<PipelineStage>,
    /// CONFIRMING or ERROR once the session has run to completion.
    final_stage: Option<PipelineStage>,
    error: Option<PipelineError>,
    payload: SessionPayload,
}

impl PipelineSession {
    pub fn new(id: u64, scene: SceneState) -> Self {
        Self {
            id,
            stage: PipelineStage::Idle,
            history: vec![PipelineStage::Idle],
            final_stage: None,
            error: None,
            payload: SessionPayload {
                scene,
                ..SessionPayload::default()
            },
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    /// Every stage visited, in order, starting with IDLE.
    pub fn history(&self) -> &[PipelineStage] {
        &self.history
    }

    pub fn final_stage(&self) -> Option<PipelineStage> {
        self.final_stage
    }

    pub fn error(&self) -> Option<&PipelineError> {
        self.error.as_ref()
    }

    pub fn payload(&self) -> &SessionPayload {
        &self.payload
    }

    fn transition(&mut self, to: PipelineStage) -> Result<(), PipelineError> {
        validate_transition(self.stage, to)?;
        tracing::debug!("session {}: {} -> {}", self.id, self.stage, to);
        self.stage = to;
        self.history.push(to);
        Ok(())
    }

    /// IDLE -> LISTENING. An empty transcript fails the session.
    pub fn listen(&mut self, transcript: &str) -> Result<(), PipelineError> {
        self.transition(PipelineStage::Listening)?;
        let transcript = transcript.trim();
        if transcript.is_empty() {
            return Err(self.fail(PipelineError::EmptyTranscript));
        }
        self.payload.transcript = transcript.to_string();
        Ok(())
    }

    /// LISTENING -> DECOMPOSING.
    pub fn begin_decomposition(&mut self) -> Result<(), PipelineError> {
        self.transition(PipelineStage::Decomposing)
    }

    /// Consumes the collaborator's answer while DECOMPOSING.
    pub fn accept_decomposition(
        &mut self,
        result: Result<Vec<ActionInvocation>, DecompositionError>,
    ) -> Result<(), PipelineError> {
        if self.stage != PipelineStage::Decomposing {
            return Err(PipelineError::IllegalTransition {
                from: self.stage,
                to: PipelineStage::SceneAnalyzing,
            });
        }
        let actions = match result {
            Ok(actions) => actions,
            Err(e) => return Err(self.fail(e.into())),
        };
        if actions.is_empty() {
            return Err(self.fail(PipelineError::EmptyPlan));
        }
        if let Some(index) = actions.iter().position(|a| a.action.trim().is_empty()) {
            return Err(self.fail(PipelineError::MalformedPlan {
                index,
                reason: "missing action name".to_string(),
            }));
        }
        tracing::info!("session {}: decomposed transcript into {} actions", self.id, actions.len());
        self.payload.action_plan = actions;
        Ok(())
    }

    /// DECOMPOSING -> SCENE_ANALYZING. Attaches the scene description; cannot fail.
    pub fn analyze_scene(&mut self) -> Result<(), PipelineError> {
        self.transition(PipelineStage::SceneAnalyzing)?;
        self.payload.scene_description = Some(describe_scene(&self.payload.scene));
        Ok(())
    }

    /// SCENE_ANALYZING -> PLANNING.
    pub fn plan(&mut self, safety: &SafetyConfig, registry: &PrimitiveRegistry) -> Result<(), PipelineError> {
        self.transition(PipelineStage::Planning)?;
        let plan = plan_trajectory(&self.payload.action_plan, &self.payload.scene, safety, registry);
        if let Some(failure) = plan.error.clone() {
            return Err(self.fail(failure.into()));
        }
        self.payload.plan = Some(plan);
        Ok(())
    }

    /// PLANNING -> VALIDATING. Unsafe trajectories fail; safe ones may need confirmation.
    pub fn validate(&mut self, config: &RuntimeConfig) -> Result<ConfirmationGate, PipelineError> {
        self.transition(PipelineStage::Validating)?;
        let Some(plan) = self.payload.plan.as_ref() else {
            return Err(self.fail(PipelineError::EmptyPlan));
        };

        let result = validate_trajectory(&plan.waypoints, Some(&self.payload.scene), &config.safety);
        if !result.is_safe {
            let err = PipelineError::SafetyViolation {
                waypoint_index: result.first_violation_index(),
                summary: result.summary,
            };
            return Err(self.fail(err));
        }

        match confirmation_requirement(&plan.waypoints, &config.safety, &config.confirmation) {
            Some(reason) => {
                tracing::info!("session {}: human confirmation required: {reason}", self.id);
                self.payload.requires_confirmation = true;
                self.payload.awaiting_confirmation = true;
                self.payload.confirmation_reason = Some(reason.clone());
                Ok(ConfirmationGate::Required { reason })
            }
            None => Ok(ConfirmationGate::Clear),
        }
    }

    /// Applies the human's answer to a pending confirmation.
    pub fn resolve_confirmation(&mut self, decision: ConfirmationDecision) -> Result<(), PipelineError> {
        if self.stage != PipelineStage::Validating || !self.payload.awaiting_confirmation {
            return Err(PipelineError::IllegalTransition {
                from: self.stage,
                to: PipelineStage::Executing,
            });
        }
        self.payload.awaiting_confirmation = false;
        match decision {
            ConfirmationDecision::Granted => {
                self.payload.confirmation_granted = true;
                Ok(())
            }
            ConfirmationDecision::Denied => Err(self.fail(PipelineError::ConfirmationDenied)),
            ConfirmationDecision::TimedOut { after_ms } => Err(self.fail(PipelineError::ConfirmationTimeout(after_ms))),
        }
    }

    /// VALIDATING -> EXECUTING. Refused while a required confirmation is outstanding.
    pub fn execute(&mut self) -> Result<ExecutionBundle, PipelineError> {
        if self.payload.requires_confirmation && !self.payload.confirmation_granted {
            return Err(PipelineError::IllegalTransition {
                from: self.stage,
                to: PipelineStage::Executing,
            });
        }
        self.transition(PipelineStage::Executing)?;
        let Some(plan) = self.payload.plan.as_ref() else {
            return Err(self.fail(PipelineError::EmptyPlan));
        };
        self.payload.execution_ready = true;
        tracing::info!("session {}: executing {} waypoints", self.id, plan.waypoints.len());
        Ok(ExecutionBundle {
            session_id: self.id,
            waypoints: plan.waypoints.clone(),
            narration: plan.narration.clone(),
        })
    }

    /// EXECUTING -> CONFIRMING -> IDLE. Returns the spoken confirmation.
    pub fn confirm(&mut self) -> Result<String, PipelineError> {
        self.transition(PipelineStage::Confirming)?;
        let narration = self.payload.plan.as_ref().map(|p| p.narration.as_slice()).unwrap_or_default();
        let message = if narration.is_empty() {
            "Done.".to_string()
        } else {
            format!("Done. {}.", narration.join(". "))
        };
        self.payload.message = Some(message.clone());
        self.final_stage = Some(PipelineStage::Confirming);
        self.transition(PipelineStage::Idle)?;
        Ok(message)
    }

    /// Moves an active session to ERROR, then back to IDLE. Returns the error for `?` chains.
    pub fn fail(&mut self, error: PipelineError) -> PipelineError {
        if self.transition(PipelineStage::Error).is_err() {
            tracing::debug!("session {}: ignoring {error} in stage {}", self.id, self.stage);
            return error;
        }
        tracing::warn!("session {}: pipeline error: {error}", self.id);

        self.payload.message = Some(format!("Sorry, I couldn't do that. {error}"));
        self.payload.action_plan.clear();
        self.payload.plan = None;
        self.payload.awaiting_confirmation = false;
        self.payload.execution_ready = false;
        self.final_stage = Some(PipelineStage::Error);
        self.error = Some(error.clone());

        if let Err(e) = self.transition(PipelineStage::Idle) {
            tracing::error!("session {}: {e}", self.id);
        }
        error
    }

    /// Cancels the session if it is still active.
    pub fn cancel(&mut self) -> PipelineError {
        self.fail(PipelineError::Cancelled)
    }

    /// Hands the finished plan out of a successful session.
    pub fn take_plan(&mut self) -> Option<TrajectoryPlan> {
        self.payload.plan.take()
    }
}
