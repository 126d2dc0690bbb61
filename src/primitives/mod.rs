//! Action primitive library.
//!
//! Twelve stateless robot behaviors. Each one expands its parameters into end-effector
//! waypoints against a scene snapshot, checks its own rules on the result, and narrates
//! itself for the user. The set is closed: [`ActionId`] enumerates it and
//! [`PrimitiveRegistry`] holds one implementation per id, indexed by discriminant.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PlanError;
use crate::scene::{SceneState, Waypoint};

mod manipulation;
mod motion;
pub(crate) mod params;
pub mod schema;

pub use manipulation::{Grasp, Place, Pour, Release, Sort, Stack};
pub use motion::{Approach, Inspect, Push, Rotate, Translate, Wait};
pub use schema::{ParamKind, ParamSpec, PrimitiveSchema, SafetyFields, SchemaDocument, SCHEMA_VERSION};

/// String-keyed primitive parameters, as produced by the decomposition collaborator.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// The closed set of primitive ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionId {
    Approach,
    Grasp,
    Release,
    Translate,
    Rotate,
    Place,
    Push,
    Pour,
    Stack,
    Sort,
    Inspect,
    Wait,
}

impl ActionId {
    /// All ids in discriminant order.
    pub const ALL: [ActionId; 12] = [
        ActionId::Approach,
        ActionId::Grasp,
        ActionId::Release,
        ActionId::Translate,
        ActionId::Rotate,
        ActionId::Place,
        ActionId::Push,
        ActionId::Pour,
        ActionId::Stack,
        ActionId::Sort,
        ActionId::Inspect,
        ActionId::Wait,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            ActionId::Approach => "APPROACH",
            ActionId::Grasp => "GRASP",
            ActionId::Release => "RELEASE",
            ActionId::Translate => "TRANSLATE",
            ActionId::Rotate => "ROTATE",
            ActionId::Place => "PLACE",
            ActionId::Push => "PUSH",
            ActionId::Pour => "POUR",
            ActionId::Stack => "STACK",
            ActionId::Sort => "SORT",
            ActionId::Inspect => "INSPECT",
            ActionId::Wait => "WAIT",
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionId {
    type Err = PlanError;

    /// Case-insensitive lookup; unknown names are [`PlanError::UnknownPrimitive`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        ActionId::ALL
            .into_iter()
            .find(|id| id.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| PlanError::UnknownPrimitive(s.to_string()))
    }
}

/// One requested action: a primitive name plus its parameters.
///
/// The action name stays a string until the planner resolves it, so an unknown name from a
/// decomposition provider surfaces as a plan error at the right step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionInvocation {
    pub action: String,
    #[serde(default)]
    pub params: Params,
}

impl ActionInvocation {
    pub fn new(action: impl Into<String>, params: Params) -> Self {
        Self {
            action: action.into(),
            params,
        }
    }

    /// Builds an invocation from a JSON object literal; non-object values mean no params.
    pub fn from_json(action: impl Into<String>, params: serde_json::Value) -> Self {
        let params = match params {
            serde_json::Value::Object(map) => map,
            _ => Params::new(),
        };
        Self::new(action, params)
    }
}

/// Outcome of a primitive's own check that does not abort the plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PrimitiveCheck {
    Pass { reason: String },
    Warning { constraint: &'static str, reason: String },
}

impl PrimitiveCheck {
    pub fn pass(reason: impl Into<String>) -> Self {
        Self::Pass {
            reason: reason.into(),
        }
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, Self::Warning { .. })
    }
}

/// The contract every primitive implements.
pub trait ActionPrimitive: Send + Sync {
    fn id(&self) -> ActionId;

    /// One-line description for primitive listings.
    fn description(&self) -> &'static str;

    /// Parameter contract; enforced by the planner before generation.
    fn schema(&self) -> PrimitiveSchema;

    /// Expands `params` into an ordered, non-empty waypoint sequence.
    fn generate_waypoints(&self, params: &Params, scene: &SceneState) -> Result<Vec<Waypoint>, PlanError>;

    /// Checks the primitive's own rules against the scene the waypoints were generated from.
    fn validate(&self, waypoints: &[Waypoint], scene: &SceneState) -> Result<PrimitiveCheck, PlanError>;

    /// Human-readable narration, suitable for speech.
    fn describe(&self, params: &Params) -> String;
}

/// Discriminant-indexed table of primitive implementations.
///
/// Built once and shared read-only; copying it is free.
#[derive(Clone, Copy)]
pub struct PrimitiveRegistry {
    table: [&'static dyn ActionPrimitive; 12],
}

impl Default for PrimitiveRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PrimitiveRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrimitiveRegistry")
            .field("primitives", &self.table.iter().map(|p| p.id()).collect::<Vec<_>>())
            .finish()
    }
}

impl PrimitiveRegistry {
    pub fn new() -> Self {
        // Order must follow `ActionId` discriminants.
        Self {
            table: [
                &Approach, &Grasp, &Release, &Translate, &Rotate, &Place, &Push, &Pour, &Stack, &Sort, &Inspect,
                &Wait,
            ],
        }
    }

    #[inline]
    pub fn get(&self, id: ActionId) -> &'static dyn ActionPrimitive {
        self.table[id.index()]
    }

    /// Resolves a primitive by (case-insensitive) name.
    pub fn resolve(&self, name: &str) -> Result<&'static dyn ActionPrimitive, PlanError> {
        let id: ActionId = name.parse()?;
        Ok(self.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static dyn ActionPrimitive> + '_ {
        self.table.iter().copied()
    }

    /// The versioned contract document for every registered primitive.
    pub fn schema_document(&self) -> SchemaDocument {
        SchemaDocument {
            version: SCHEMA_VERSION,
            primitives: self.iter().map(|p| p.schema()).collect(),
        }
    }
}

/// Id and description of every registered primitive.
pub fn list_available_primitives(registry: &PrimitiveRegistry) -> Vec<(ActionId, &'static str)> {
    registry.iter().map(|p| (p.id(), p.description())).collect()
}
