//! Motion plan validation and approval core.
//!
//! This crate turns high-level action requests for a manipulator arm into checked,
//! ordered end-effector waypoints and runs them through an approval pipeline:
//! - [`scene`]: world state (objects, end-effector, gripper).
//! - [`primitives`]: the twelve action primitives, their registry and versioned schema.
//! - [`planner`]: fail-fast sequencing of primitives over an evolving scene copy.
//! - [`safety`]: pure constraint checks over a full waypoint sequence.
//! - [`pipeline`]: the per-session state machine and its async runtime with a
//!   human-confirmation gate.
//! - [`decomposition`], [`analysis`], [`journal`]: collaborator contracts, scene
//!   descriptions and the persistent session record.

pub mod analysis;
pub mod config;
pub mod decomposition;
pub mod error;
pub mod journal;
pub mod pipeline;
pub mod planner;
pub mod primitives;
pub mod safety;
pub mod scene;

// Re-export for downstream crates so they can open or inspect the journal without declaring
// a direct dependency on `sled`.
pub use sled;

pub use config::{ConfirmationPolicy, RuntimeConfig, SafetyConfig, WorkspaceBounds};
pub use error::{ConfigError, DecompositionError, JournalError, PipelineError, PlanError, SceneError};
pub use pipeline::{PipelineRuntime, PipelineStage, SessionHandle, SessionOutcome, SessionRequest};
pub use planner::{plan_trajectory, ActionStep, PlanFailure, TrajectoryPlan};
pub use primitives::{list_available_primitives, ActionId, ActionInvocation, PrimitiveRegistry};
pub use safety::{validate_trajectory, SafetyValidationResult, Severity, Violation};
pub use scene::{SceneObject, SceneState, Shape, Vector3D, Waypoint};

/// Default on-disk plan journal location (Sled).
pub const DEFAULT_JOURNAL_PATH: &str = "motion_plan_journal";
