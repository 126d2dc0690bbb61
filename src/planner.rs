//! Trajectory planner.
//!
//! Turns an ordered list of [`ActionInvocation`]s into a [`TrajectoryPlan`]. The planner keeps
//! a private copy of the scene and folds each validated action's effect into it, so later
//! actions see what earlier ones did (a STACK after a GRASP sees the object as held).
//! Planning is fail-fast: the first step that cannot be generated or validated ends the plan.

use serde::Serialize;
use serde_json::Value;

use crate::config::SafetyConfig;
use crate::error::{PipelineError, PlanError};
use crate::primitives::{ActionId, ActionInvocation, Params, PrimitiveCheck, PrimitiveRegistry};
use crate::safety::{validate_trajectory, SafetyValidationResult};
use crate::scene::{SceneState, Waypoint};

/// One resolved action with the waypoints it contributes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionStep {
    pub index: usize,
    pub action: ActionId,
    pub params: Params,
    pub waypoints: Vec<Waypoint>,
    pub validation: PrimitiveCheck,
    pub narration: String,
}

/// Why a plan is invalid, tied to the step that caused it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanFailure {
    /// Offending step; for full-trajectory failures, the step owning the first bad waypoint.
    pub step_index: Option<usize>,
    /// Action name as requested.
    pub action: Option<String>,
    pub error: PlanError,
}

impl PlanFailure {
    /// Plain-language message for the failure.
    pub fn message(&self) -> String {
        match (&self.action, self.step_index, &self.error) {
            (_, _, PlanError::SafetyViolation { reason, .. }) if self.action.is_none() => reason.clone(),
            (Some(action), Some(i), error) => format!("Step {i} ({action}): {error}"),
            (_, _, error) => error.to_string(),
        }
    }
}

impl std::fmt::Display for PlanFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message())
    }
}

impl From<PlanFailure> for PipelineError {
    fn from(failure: PlanFailure) -> Self {
        match (failure.action, failure.step_index, failure.error) {
            (Some(action), Some(step_index), error) => PipelineError::Planning {
                step_index,
                action,
                error,
            },
            (_, _, error) => PipelineError::SafetyViolation {
                waypoint_index: error.waypoint_index(),
                summary: error.to_string(),
            },
        }
    }
}

/// Output of [`plan_trajectory`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrajectoryPlan {
    /// Steps that were generated and validated, in order.
    pub steps: Vec<ActionStep>,
    /// Exact concatenation of every step's waypoints.
    pub waypoints: Vec<Waypoint>,
    pub safety: SafetyValidationResult,
    pub narration: Vec<String>,
    pub is_valid: bool,
    pub error: Option<PlanFailure>,
}

impl TrajectoryPlan {
    /// Step that owns the flattened waypoint at `waypoint_index`.
    pub fn step_for_waypoint(&self, waypoint_index: usize) -> Option<usize> {
        let mut end = 0;
        self.steps.iter().find_map(|step| {
            end += step.waypoints.len();
            (waypoint_index < end).then_some(step.index)
        })
    }

    fn failed(steps: Vec<ActionStep>, narration: Vec<String>, failure: PlanFailure) -> Self {
        let waypoints = steps.iter().flat_map(|s| s.waypoints.iter().copied()).collect();
        Self {
            steps,
            waypoints,
            safety: SafetyValidationResult {
                is_safe: false,
                violations: Vec::new(),
                warnings: Vec::new(),
                summary: failure.message(),
            },
            narration,
            is_valid: false,
            error: Some(failure),
        }
    }
}

/// Plans `actions` against `scene` and validates the whole trajectory once at the end.
#[tracing::instrument(level = "debug", skip_all, fields(actions = actions.len()))]
pub fn plan_trajectory(
    actions: &[ActionInvocation],
    scene: &SceneState,
    config: &SafetyConfig,
    registry: &PrimitiveRegistry,
) -> TrajectoryPlan {
    let mut current = scene.clone();
    let mut steps: Vec<ActionStep> = Vec::with_capacity(actions.len());
    let mut narration = Vec::with_capacity(actions.len());

    for (index, invocation) in actions.iter().enumerate() {
        let label = invocation.action.trim().to_uppercase();
        let step = match plan_step(index, invocation, &current, registry) {
            Ok(step) => step,
            Err(error) => {
                match &error {
                    PlanError::UnknownPrimitive(name) => {
                        tracing::error!("Unknown action at step {index}: {name}")
                    }
                    other => tracing::warn!("Step {index} ({label}) rejected: {other}"),
                }
                let failure = PlanFailure {
                    step_index: Some(index),
                    action: Some(label),
                    error,
                };
                return TrajectoryPlan::failed(steps, narration, failure);
            }
        };

        tracing::debug!(
            "Step {index} ({}) -> {} waypoints: {}",
            step.action,
            step.waypoints.len(),
            step.narration
        );
        apply_effect(&mut current, step.action, &step.params, &step.waypoints);
        narration.push(step.narration.clone());
        steps.push(step);
    }

    let waypoints: Vec<Waypoint> = steps.iter().flat_map(|s| s.waypoints.iter().copied()).collect();
    let safety = validate_trajectory(&waypoints, Some(scene), config);

    let mut plan = TrajectoryPlan {
        steps,
        waypoints,
        is_valid: safety.is_safe,
        safety,
        narration,
        error: None,
    };

    if plan.is_valid {
        tracing::info!(
            "Trajectory plan valid: {} steps, {} waypoints",
            plan.steps.len(),
            plan.waypoints.len()
        );
    } else {
        tracing::warn!("Trajectory plan failed safety: {}", plan.safety.summary);
        let waypoint_index = plan.safety.first_violation_index();
        let constraint = plan
            .safety
            .violations
            .first()
            .map(|v| v.constraint.to_string())
            .unwrap_or_default();
        plan.error = Some(PlanFailure {
            step_index: waypoint_index.and_then(|i| plan.step_for_waypoint(i)),
            action: None,
            error: PlanError::SafetyViolation {
                constraint,
                reason: plan.safety.summary.clone(),
                waypoint_index,
            },
        });
    }
    plan
}

fn plan_step(
    index: usize,
    invocation: &ActionInvocation,
    scene: &SceneState,
    registry: &PrimitiveRegistry,
) -> Result<ActionStep, PlanError> {
    let primitive = registry.resolve(&invocation.action)?;
    primitive.schema().check(&invocation.params)?;

    let waypoints = primitive.generate_waypoints(&invocation.params, scene)?;
    if waypoints.is_empty() {
        return Err(PlanError::precondition("no_waypoints", "primitive produced no waypoints"));
    }
    let validation = primitive.validate(&waypoints, scene)?;
    check_keeps_grip(primitive.id(), &waypoints, scene)?;

    Ok(ActionStep {
        index,
        action: primitive.id(),
        params: invocation.params.clone(),
        narration: primitive.describe(&invocation.params),
        waypoints,
        validation,
    })
}

/// Only RELEASE, PLACE and STACK may open the gripper while an object is held.
fn check_keeps_grip(action: ActionId, waypoints: &[Waypoint], scene: &SceneState) -> Result<(), PlanError> {
    let releases = matches!(action, ActionId::Release | ActionId::Place | ActionId::Stack);
    if !scene.is_holding() || releases {
        return Ok(());
    }
    match waypoints.iter().position(|w| w.gripper_open) {
        Some(i) => Err(PlanError::precondition(
            "gripper_opened_while_holding",
            format!("{action} would open the gripper at waypoint {i} while holding an object"),
        )),
        None => Ok(()),
    }
}

/// Folds a validated action into the planner's scene copy.
fn apply_effect(scene: &mut SceneState, action: ActionId, params: &Params, waypoints: &[Waypoint]) {
    let Some(last) = waypoints.last() else {
        return;
    };
    scene.end_effector = last.position();
    scene.gripper_open = last.gripper_open;

    match action {
        ActionId::Grasp => {
            if let Some(target) = params.get("target").and_then(Value::as_str) {
                if let Err(e) = scene.grasp(target) {
                    tracing::warn!("Grasp effect not applied: {e}");
                }
            }
        }
        ActionId::Release => {
            let at = scene.end_effector;
            scene.release(Some(at));
        }
        ActionId::Place | ActionId::Stack => {
            let release = waypoints.iter().find(|w| w.gripper_open).unwrap_or(last);
            scene.release(Some(release.position()));
        }
        ActionId::Translate => {
            let ee = scene.end_effector;
            if let Some(held) = scene.held_object_id.clone() {
                if let Some(obj) = scene.objects.get_mut(&held) {
                    obj.position = ee;
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::test_support::tabletop;
    use serde_json::json;

    fn inv(action: &str, params: Value) -> ActionInvocation {
        ActionInvocation::from_json(action, params)
    }

    fn plan(actions: &[ActionInvocation]) -> TrajectoryPlan {
        plan_trajectory(actions, &tabletop(), &SafetyConfig::default(), &PrimitiveRegistry::new())
    }

    #[test]
    fn pick_and_stack_plans_end_to_end() {
        let result = plan(&[
            inv("APPROACH", json!({"target": "red_cube"})),
            inv("GRASP", json!({"target": "red_cube"})),
            inv("STACK", json!({"target": "blue_cube"})),
        ]);

        assert!(result.is_valid, "{:?}", result.error);
        assert_eq!(result.steps.len(), 3);
        assert_eq!(result.narration, ["Approaching red_cube", "Grasping red_cube", "Stacking object on blue_cube"]);
        let total: usize = result.steps.iter().map(|s| s.waypoints.len()).sum();
        assert_eq!(result.waypoints.len(), total);
        assert!(result.error.is_none());
    }

    #[test]
    fn stops_at_first_failing_step() {
        let result = plan(&[
            inv("APPROACH", json!({"target": "red_cube"})),
            inv("GRASP", json!({"target": "red_cube"})),
            inv("APPROACH", json!({"target": "missing_obj"})),
            inv("RELEASE", json!({})),
        ]);

        assert!(!result.is_valid);
        assert_eq!(result.steps.len(), 2);
        assert!(result.steps.iter().all(|s| s.index < 2));
        let failure = result.error.as_ref().expect("invalid plan carries an error");
        assert_eq!(failure.step_index, Some(2));
        assert_eq!(failure.error, PlanError::UnknownTarget("missing_obj".to_string()));
        assert_eq!(failure.message(), "Step 2 (APPROACH): object 'missing_obj' not found in scene");
    }

    #[test]
    fn grasp_effect_is_visible_to_later_steps() {
        // Without the folded GRASP the second one would pass.
        let result = plan(&[
            inv("GRASP", json!({"target": "red_cube"})),
            inv("GRASP", json!({"target": "blue_cube"})),
        ]);
        let failure = result.error.expect("second grasp must fail");
        assert_eq!(failure.step_index, Some(1));
        assert!(matches!(failure.error, PlanError::Precondition { constraint: "gripper_occupied", .. }));
    }

    #[test]
    fn stack_relocates_the_held_object() {
        let mut scene = tabletop();
        let actions = [
            inv("GRASP", json!({"target": "red_cube"})),
            inv("STACK", json!({"target": "blue_cube"})),
        ];
        let registry = PrimitiveRegistry::new();
        for (i, a) in actions.iter().enumerate() {
            let step = plan_step(i, a, &scene, &registry).unwrap();
            apply_effect(&mut scene, step.action, &step.params, &step.waypoints);
        }

        assert!(!scene.is_holding());
        assert!(scene.gripper_open);
        let red = scene.object("red_cube").unwrap();
        assert!((red.position.y() - 0.65).abs() < 1e-9);
        assert!((red.position.x() - (-0.3)).abs() < 1e-9);
        scene.check_consistency().unwrap();
    }

    #[test]
    fn held_object_stays_gripped_through_approach() {
        let mut scene = tabletop();
        let registry = PrimitiveRegistry::new();
        for (i, a) in [
            inv("GRASP", json!({"target": "red_cube"})),
            inv("APPROACH", json!({"target": "blue_cube"})),
        ]
        .iter()
        .enumerate()
        {
            let step = plan_step(i, a, &scene, &registry).unwrap();
            apply_effect(&mut scene, step.action, &step.params, &step.waypoints);
        }

        assert_eq!(scene.held_object_id.as_deref(), Some("red_cube"));
        assert!(!scene.gripper_open);
        scene.check_consistency().unwrap();

        let result = plan(&[
            inv("GRASP", json!({"target": "red_cube"})),
            inv("APPROACH", json!({"target": "blue_cube"})),
            inv("STACK", json!({"target": "blue_cube"})),
        ]);
        assert!(result.is_valid, "{:?}", result.error);
        assert!(result.steps[1].waypoints.iter().all(|w| !w.gripper_open));
    }

    #[test]
    fn opening_the_gripper_mid_hold_fails_the_step() {
        let result = plan(&[
            inv("GRASP", json!({"target": "red_cube"})),
            inv("SORT", json!({"objects": ["blue_cube", "green_cyl"]})),
        ]);
        let failure = result.error.expect("sorting with a full gripper must fail");
        assert_eq!(failure.step_index, Some(1));
        assert!(matches!(failure.error, PlanError::Precondition { constraint: "gripper_occupied", .. }));

        let mut scene = tabletop();
        scene.grasp("red_cube").unwrap();
        let dropping = [Waypoint::new(0.3, 0.9, 0.0, false), Waypoint::new(0.3, 0.9, 0.0, true)];
        let err = check_keeps_grip(ActionId::Translate, &dropping, &scene).unwrap_err();
        assert!(matches!(err, PlanError::Precondition { constraint: "gripper_opened_while_holding", .. }));
        assert!(check_keeps_grip(ActionId::Release, &dropping, &scene).is_ok());
        assert!(check_keeps_grip(ActionId::Translate, &dropping, &tabletop()).is_ok());
    }

    #[test]
    fn translate_carries_held_object() {
        let mut scene = tabletop();
        scene.grasp("red_cube").unwrap();
        let wps = [Waypoint::new(0.1, 0.9, 0.1, false)];
        apply_effect(&mut scene, ActionId::Translate, &Params::new(), &wps);
        assert_eq!(scene.object("red_cube").unwrap().position, wps[0].position());
    }

    #[test]
    fn unknown_primitive_and_bad_params_fail_the_step() {
        let result = plan(&[inv("FLY", json!({}))]);
        let failure = result.error.unwrap();
        assert_eq!(failure.error, PlanError::UnknownPrimitive("FLY".to_string()));
        assert!(result.waypoints.is_empty());

        let result = plan(&[inv("ROTATE", json!({"axis": "q", "degrees": 10}))]);
        assert!(matches!(result.error.unwrap().error, PlanError::Parameter { .. }));
    }

    #[test]
    fn safety_failure_names_the_owning_step() {
        let config = SafetyConfig {
            max_linear_velocity: 0.1,
            ..SafetyConfig::default()
        };
        let result = plan_trajectory(
            &[inv("WAIT", json!({})), inv("TRANSLATE", json!({"position": [0.5, 1.0, 0.0]}))],
            &tabletop(),
            &config,
            &PrimitiveRegistry::new(),
        );

        assert!(!result.is_valid);
        assert_eq!(result.steps.len(), 2);
        let failure = result.error.unwrap();
        assert_eq!(failure.step_index, Some(1));
        assert!(failure.message().starts_with("Trajectory UNSAFE"));
        let err: PipelineError = failure.into();
        assert!(matches!(err, PipelineError::SafetyViolation { waypoint_index: Some(_), .. }));
    }
}
