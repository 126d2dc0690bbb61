//! Error types for the motion core.
//!
//! - [`PlanError`]: anything that aborts a trajectory plan (bad parameters, unknown targets or
//!   primitives, broken preconditions, safety failures).
//! - [`PipelineError`]: reasons a session ends in `ERROR`.
//! - [`DecompositionError`]: failures of the external decomposition collaborator.
//! - [`SceneError`], [`ConfigError`], [`JournalError`]: input and infrastructure errors.

use serde::Serialize;

use crate::pipeline::PipelineStage;

/// Errors that abort a plan at the step where they occur.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum PlanError {
    /// Missing or invalid parameter
    #[error("parameter '{name}': {reason}")]
    Parameter { name: String, reason: String },

    /// Referenced object id is not in the scene
    #[error("object '{0}' not found in scene")]
    UnknownTarget(String),

    /// Action id is not registered
    #[error("unknown action primitive '{0}'")]
    UnknownPrimitive(String),

    /// Scene does not allow this action (e.g. grasping while already holding)
    #[error("{reason}")]
    Precondition {
        constraint: &'static str,
        reason: String,
    },

    /// A waypoint breaks a hard constraint
    #[error("{reason}")]
    SafetyViolation {
        constraint: String,
        reason: String,
        waypoint_index: Option<usize>,
    },
}

impl PlanError {
    pub fn parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn precondition(constraint: &'static str, reason: impl Into<String>) -> Self {
        Self::Precondition {
            constraint,
            reason: reason.into(),
        }
    }

    /// Index of the offending waypoint, when the error is tied to one.
    #[must_use]
    pub fn waypoint_index(&self) -> Option<usize> {
        match self {
            Self::SafetyViolation { waypoint_index, .. } => *waypoint_index,
            _ => None,
        }
    }
}

/// Errors from the decomposition collaborator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecompositionError {
    /// Every provider was tried and none produced a usable plan
    #[error("no decomposition provider available: {0}")]
    Unavailable(String),

    /// One provider failed (network, rate limit, local runtime down)
    #[error("provider '{provider}' failed: {reason}")]
    Provider { provider: String, reason: String },

    /// The provider answered but the answer is not an action plan
    #[error("response is not a valid action plan: {0}")]
    InvalidResponse(String),

    /// The plan parsed but an action does not fit the scene or the schema
    #[error("action {index}: {reason}")]
    Rejected { index: usize, reason: String },
}

impl DecompositionError {
    /// Whether another attempt (same or next provider) may succeed.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Unavailable(_))
    }
}

/// Reasons a pipeline session ends in `ERROR`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("No speech transcript received")]
    EmptyTranscript,

    #[error("Decomposition returned no actions")]
    EmptyPlan,

    #[error("Action {index} has invalid structure: {reason}")]
    MalformedPlan { index: usize, reason: String },

    #[error("{0}")]
    Decomposition(#[from] DecompositionError),

    /// Planning stopped at a step
    #[error("Step {step_index} ({action}): {error}")]
    Planning {
        step_index: usize,
        action: String,
        error: PlanError,
    },

    /// Full-trajectory validation failed
    #[error("{summary}")]
    SafetyViolation {
        summary: String,
        waypoint_index: Option<usize>,
    },

    #[error("Human confirmation was denied")]
    ConfirmationDenied,

    #[error("Human confirmation timed out after {0} ms")]
    ConfirmationTimeout(u64),

    #[error("Session cancelled")]
    Cancelled,

    #[error("illegal pipeline transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: PipelineStage,
        to: PipelineStage,
    },

    #[error("session task failed: {0}")]
    TaskFailed(String),
}

impl PipelineError {
    /// Step index carried by the error, if any.
    #[must_use]
    pub fn step_index(&self) -> Option<usize> {
        match self {
            Self::Planning { step_index, .. } => Some(*step_index),
            Self::MalformedPlan { index, .. } => Some(*index),
            Self::Decomposition(DecompositionError::Rejected { index, .. }) => Some(*index),
            _ => None,
        }
    }

    /// Waypoint index carried by the error, if any.
    #[must_use]
    pub fn waypoint_index(&self) -> Option<usize> {
        match self {
            Self::Planning { error, .. } => error.waypoint_index(),
            Self::SafetyViolation { waypoint_index, .. } => *waypoint_index,
            _ => None,
        }
    }
}

/// Scene ingestion errors.
#[derive(Debug, thiserror::Error)]
pub enum SceneError {
    #[error("duplicate object id '{0}'")]
    DuplicateObject(String),

    #[error("held object '{0}' is not in the scene")]
    HeldObjectMissing(String),

    #[error("object '{0}' held flag disagrees with held_object_id")]
    HeldFlagMismatch(String),

    #[error("gripper reported open while holding '{0}'")]
    GripperOpenWhileHolding(String),

    #[error("invalid scene document: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Plan journal errors.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal storage error: {0}")]
    Db(#[from] sled::Error),

    #[error("journal encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}
