//! Approval pipeline.
//!
//! ```text
//! IDLE -> LISTENING -> DECOMPOSING -> SCENE_ANALYZING -> PLANNING -> VALIDATING
//!      -> EXECUTING -> CONFIRMING -> IDLE
//! any active stage -> ERROR -> IDLE
//! ```
//!
//! [`PipelineSession`] is the state machine value for one request; [`PipelineRuntime`] runs
//! each session as its own task and exposes the human-confirmation gate.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

mod runtime;
mod session;

pub use runtime::{PipelineRuntime, SessionControl, SessionHandle, SessionOutcome, SessionRequest, SessionStatus};
pub use session::{
    confirmation_requirement, ConfirmationDecision, ConfirmationGate, ExecutionBundle, PipelineSession, SessionPayload,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    Idle,
    Listening,
    Decomposing,
    SceneAnalyzing,
    Planning,
    Validating,
    Executing,
    Confirming,
    Error,
}

impl PipelineStage {
    pub const fn as_str(self) -> &'static str {
        match self {
            PipelineStage::Idle => "IDLE",
            PipelineStage::Listening => "LISTENING",
            PipelineStage::Decomposing => "DECOMPOSING",
            PipelineStage::SceneAnalyzing => "SCENE_ANALYZING",
            PipelineStage::Planning => "PLANNING",
            PipelineStage::Validating => "VALIDATING",
            PipelineStage::Executing => "EXECUTING",
            PipelineStage::Confirming => "CONFIRMING",
            PipelineStage::Error => "ERROR",
        }
    }

    /// Stages that may still fail or be cancelled.
    pub fn is_active(self) -> bool {
        allowed_transitions(self).contains(&PipelineStage::Error)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn allowed_transitions(from: PipelineStage) -> Vec<PipelineStage> {
    use PipelineStage::*;
    match from {
        Idle => vec![Listening],
        Listening => vec![Decomposing, Error],
        Decomposing => vec![SceneAnalyzing, Error],
        SceneAnalyzing => vec![Planning, Error],
        Planning => vec![Validating, Error],
        Validating => vec![Executing, Error],
        Executing => vec![Confirming, Error],
        Confirming => vec![Idle],
        Error => vec![Idle],
    }
}

/// Fails with [`PipelineError::IllegalTransition`] for any edge not in the table.
pub fn validate_transition(from: PipelineStage, to: PipelineStage) -> Result<(), PipelineError> {
    if allowed_transitions(from).into_iter().any(|s| s == to) {
        Ok(())
    } else {
        Err(PipelineError::IllegalTransition { from, to })
    }
}
