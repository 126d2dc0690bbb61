//! Primitives that move the end-effector without changing what it holds.

use serde_json::json;

use crate::error::PlanError;
use crate::primitives::params::{
    check_above_table, f64_or, object, optional_str, optional_vec3, required_f64, required_str, required_vec3,
    safe_height,
};
use crate::primitives::schema::{ParamKind, ParamSpec, PrimitiveSchema, SafetyFields};
use crate::primitives::{ActionId, ActionPrimitive, Params, PrimitiveCheck};
use crate::scene::{SceneState, Vector3D, Waypoint};

/// Rotation is interpolated in steps of at most this many degrees.
const ROTATE_STEP_DEG: f64 = 15.0;

/// Largest orientation change a single rotation step may make (per axis).
const ROTATE_MAX_STEP_DEG: f64 = 90.0;

const PUSH_APPROACH_OFFSET: f64 = 0.08;
const PUSH_RETRACT_LIFT: f64 = 0.15;
const INSPECT_PITCH_DEG: f64 = -30.0;

/// Table tolerance for primitives that work at object height.
const CONTACT_TOLERANCE: f64 = 0.01;

fn target_or<'a>(params: &'a Params, name: &str, fallback: &'a str) -> &'a str {
    params.get(name).and_then(|v| v.as_str()).unwrap_or(fallback)
}

/// Move the end-effector near a target object: lift, traverse, descend to an offset.
#[derive(Debug, Clone, Copy)]
pub struct Approach;

impl ActionPrimitive for Approach {
    fn id(&self) -> ActionId {
        ActionId::Approach
    }

    fn description(&self) -> &'static str {
        "Move end-effector near a target object"
    }

    fn schema(&self) -> PrimitiveSchema {
        PrimitiveSchema {
            id: self.id(),
            description: self.description(),
            params: vec![
                ParamSpec::required("target", ParamKind::ObjectId, "Object to approach"),
                ParamSpec::optional("offset", ParamKind::Vec3, Some(json!([0.0, 0.05, 0.0])), "Offset from object center (m)"),
            ],
            preconditions: vec!["target exists in scene"],
            postconditions: vec!["end-effector at target + offset", "gripper open unless holding"],
            safety: SafetyFields::default(),
        }
    }

    fn generate_waypoints(&self, params: &Params, scene: &SceneState) -> Result<Vec<Waypoint>, PlanError> {
        let obj = object(scene, required_str(params, "target")?)?;
        let offset = optional_vec3(params, "offset")?.unwrap_or(Vector3D::new(0.0, 0.05, 0.0));
        let ee = scene.end_effector;
        let safe_y = safe_height(scene, &[]);
        let goal = Vector3D(obj.position.0 + offset.0);
        // Opens for a grasp unless something is already in hand.
        let open = !scene.is_holding();

        Ok(vec![
            Waypoint::new(ee.x(), safe_y, ee.z(), scene.gripper_open),
            Waypoint::new(goal.x(), safe_y, goal.z(), open),
            Waypoint::at(goal, open),
        ])
    }

    fn validate(&self, waypoints: &[Waypoint], scene: &SceneState) -> Result<PrimitiveCheck, PlanError> {
        check_above_table(waypoints, scene, 0.0, "Approach")?;
        Ok(PrimitiveCheck::pass("Approach trajectory valid"))
    }

    fn describe(&self, params: &Params) -> String {
        format!("Approaching {}", target_or(params, "target", "object"))
    }
}

/// Move to an absolute `position` or by a relative `delta`.
#[derive(Debug, Clone, Copy)]
pub struct Translate;

impl ActionPrimitive for Translate {
    fn id(&self) -> ActionId {
        ActionId::Translate
    }

    fn description(&self) -> &'static str {
        "Move end-effector to an absolute or relative position"
    }

    fn schema(&self) -> PrimitiveSchema {
        PrimitiveSchema {
            id: self.id(),
            description: self.description(),
            params: vec![
                ParamSpec::optional("position", ParamKind::Vec3, None, "Absolute target (m); takes precedence over delta"),
                ParamSpec::optional("delta", ParamKind::Vec3, None, "Relative displacement (m)"),
            ],
            preconditions: vec!["one of position or delta given"],
            postconditions: vec!["end-effector at target", "held object carried along"],
            safety: SafetyFields {
                stability_check: true,
                ..SafetyFields::default()
            },
        }
    }

    fn generate_waypoints(&self, params: &Params, scene: &SceneState) -> Result<Vec<Waypoint>, PlanError> {
        let ee = scene.end_effector;
        let target = match (optional_vec3(params, "position")?, optional_vec3(params, "delta")?) {
            (Some(position), _) => position,
            (None, Some(delta)) => Vector3D(ee.0 + delta.0),
            (None, None) => {
                return Err(PlanError::parameter("position", "TRANSLATE requires 'position' or 'delta'"));
            }
        };
        let gripper = scene.gripper_open && !scene.is_holding();
        let safe_y = safe_height(scene, &[target.y()]);

        Ok(vec![
            Waypoint::new(ee.x(), safe_y, ee.z(), gripper),
            Waypoint::new(target.x(), safe_y, target.z(), gripper),
            Waypoint::at(target, gripper),
        ])
    }

    fn validate(&self, waypoints: &[Waypoint], scene: &SceneState) -> Result<PrimitiveCheck, PlanError> {
        check_above_table(waypoints, scene, 0.0, "Translate")?;
        Ok(PrimitiveCheck::pass("Translation valid"))
    }

    fn describe(&self, params: &Params) -> String {
        if let Ok(Some(p)) = optional_vec3(params, "position") {
            return format!("Moving to position ({:.2}, {:.2}, {:.2})", p.x(), p.y(), p.z());
        }
        if let Ok(Some(d)) = optional_vec3(params, "delta") {
            return format!("Moving by ({:.2}, {:.2}, {:.2})", d.x(), d.y(), d.z());
        }
        "Translating end-effector".to_string()
    }
}

/// Rotate in place about one axis, one interpolated waypoint per 15°.
#[derive(Debug, Clone, Copy)]
pub struct Rotate;

impl ActionPrimitive for Rotate {
    fn id(&self) -> ActionId {
        ActionId::Rotate
    }

    fn description(&self) -> &'static str {
        "Rotate end-effector around a specified axis"
    }

    fn schema(&self) -> PrimitiveSchema {
        PrimitiveSchema {
            id: self.id(),
            description: self.description(),
            params: vec![
                ParamSpec::required("axis", ParamKind::Enum { values: &["x", "y", "z"] }, "Rotation axis"),
                ParamSpec::required(
                    "degrees",
                    ParamKind::Number {
                        min: -360.0,
                        max: 360.0,
                        unit: "deg",
                    },
                    "Rotation angle",
                ),
            ],
            preconditions: vec![],
            postconditions: vec!["orientation rotated by degrees about axis"],
            safety: SafetyFields {
                collision_check: false,
                max_velocity: None,
                ..SafetyFields::default()
            },
        }
    }

    fn generate_waypoints(&self, params: &Params, scene: &SceneState) -> Result<Vec<Waypoint>, PlanError> {
        let axis = required_str(params, "axis")?;
        let degrees = required_f64(params, "degrees")?;
        let rads = degrees.to_radians();

        // y is up, so a turn about y is yaw and about z is pitch.
        let (roll, pitch, yaw) = match axis {
            "x" => (rads, 0.0, 0.0),
            "y" => (0.0, 0.0, rads),
            "z" => (0.0, rads, 0.0),
            other => return Err(PlanError::parameter("axis", format!("'{other}' is not one of x, y, z"))),
        };

        let steps = ((degrees.abs() / ROTATE_STEP_DEG) as usize).max(2);
        let ee = scene.end_effector;
        Ok((1..=steps)
            .map(|i| {
                let t = i as f64 / steps as f64;
                Waypoint::at(ee, scene.gripper_open).with_orientation(roll * t, pitch * t, yaw * t)
            })
            .collect())
    }

    fn validate(&self, waypoints: &[Waypoint], _scene: &SceneState) -> Result<PrimitiveCheck, PlanError> {
        let limit = ROTATE_MAX_STEP_DEG.to_radians();
        for (i, pair) in waypoints.windows(2).enumerate() {
            let delta = pair[1].orientation() - pair[0].orientation();
            if delta.iter().any(|d| d.abs() > limit) {
                return Err(PlanError::SafetyViolation {
                    constraint: "max_angular_velocity".to_string(),
                    reason: format!("Angular step exceeded {ROTATE_MAX_STEP_DEG}° at waypoint {}", i + 1),
                    waypoint_index: Some(i + 1),
                });
            }
        }
        Ok(PrimitiveCheck::pass("Rotation valid"))
    }

    fn describe(&self, params: &Params) -> String {
        match (params.get("degrees"), params.get("axis").and_then(|v| v.as_str())) {
            (Some(deg), Some(axis)) => format!("Rotating {deg}° around {axis}-axis"),
            _ => "Rotating end-effector".to_string(),
        }
    }
}

/// Push an object along a direction: approach from the far side, contact, push, retract.
#[derive(Debug, Clone, Copy)]
pub struct Push;

impl ActionPrimitive for Push {
    fn id(&self) -> ActionId {
        ActionId::Push
    }

    fn description(&self) -> &'static str {
        "Push an object along a direction"
    }

    fn schema(&self) -> PrimitiveSchema {
        PrimitiveSchema {
            id: self.id(),
            description: self.description(),
            params: vec![
                ParamSpec::required("target", ParamKind::ObjectId, "Object to push"),
                ParamSpec::required("direction", ParamKind::Vec3, "Push direction (normalized internally)"),
                ParamSpec::required(
                    "distance",
                    ParamKind::Number {
                        min: 0.0,
                        max: 1.0,
                        unit: "m",
                    },
                    "Push distance",
                ),
            ],
            preconditions: vec!["target exists in scene", "direction is non-zero"],
            postconditions: vec!["target displaced by distance along direction", "gripper open"],
            safety: SafetyFields {
                max_velocity: Some(0.3),
                max_force: Some(15.0),
                ..SafetyFields::default()
            },
        }
    }

    fn generate_waypoints(&self, params: &Params, scene: &SceneState) -> Result<Vec<Waypoint>, PlanError> {
        let obj = object(scene, required_str(params, "target")?)?;
        let direction = required_vec3(params, "direction")?;
        let distance = required_f64(params, "distance")?;

        let magnitude = direction.0.norm();
        if magnitude < 1e-6 {
            return Err(PlanError::parameter("direction", "push direction has zero magnitude"));
        }
        let dir = direction.0 / magnitude;
        let p = obj.position;
        let end = Vector3D(p.0 + dir * distance);
        let retract_open = !scene.is_holding();

        Ok(vec![
            Waypoint::new(p.x() - dir.x * PUSH_APPROACH_OFFSET, p.y(), p.z() - dir.z * PUSH_APPROACH_OFFSET, false),
            Waypoint::at(p, false),
            Waypoint::at(end, false),
            Waypoint::new(end.x(), p.y() + PUSH_RETRACT_LIFT, end.z(), retract_open),
        ])
    }

    fn validate(&self, waypoints: &[Waypoint], scene: &SceneState) -> Result<PrimitiveCheck, PlanError> {
        check_above_table(waypoints, scene, CONTACT_TOLERANCE, "Push")?;
        Ok(PrimitiveCheck::pass("Push trajectory valid"))
    }

    fn describe(&self, params: &Params) -> String {
        match params.get("distance") {
            Some(d) => format!("Pushing {} {d}m", target_or(params, "target", "object")),
            None => "Pushing object".to_string(),
        }
    }
}

/// Look at a target from above and behind, pitched down 30°, and hold for capture.
#[derive(Debug, Clone, Copy)]
pub struct Inspect;

impl ActionPrimitive for Inspect {
    fn id(&self) -> ActionId {
        ActionId::Inspect
    }

    fn description(&self) -> &'static str {
        "Move to observe a target for scene capture"
    }

    fn schema(&self) -> PrimitiveSchema {
        PrimitiveSchema {
            id: self.id(),
            description: self.description(),
            params: vec![
                ParamSpec::required("target", ParamKind::ObjectId, "Object to observe"),
                ParamSpec::optional(
                    "distance",
                    ParamKind::Number {
                        min: 0.0,
                        max: 1.0,
                        unit: "m",
                    },
                    Some(json!(0.15)),
                    "Viewing distance",
                ),
            ],
            preconditions: vec!["target exists in scene"],
            postconditions: vec!["camera pointed at target"],
            safety: SafetyFields {
                timeout_ms: 5_000,
                ..SafetyFields::default()
            },
        }
    }

    fn generate_waypoints(&self, params: &Params, scene: &SceneState) -> Result<Vec<Waypoint>, PlanError> {
        let obj = object(scene, required_str(params, "target")?)?;
        let distance = f64_or(params, "distance", 0.15)?;
        let p = obj.position;
        let view = Waypoint::new(p.x(), p.y() + distance + 0.1, p.z() - distance, !scene.is_holding()).with_orientation(
            0.0,
            INSPECT_PITCH_DEG.to_radians(),
            0.0,
        );
        Ok(vec![view, view])
    }

    fn validate(&self, waypoints: &[Waypoint], scene: &SceneState) -> Result<PrimitiveCheck, PlanError> {
        check_above_table(waypoints, scene, 0.0, "Inspect")?;
        Ok(PrimitiveCheck::pass("Inspect position valid"))
    }

    fn describe(&self, params: &Params) -> String {
        match optional_str(params, "target") {
            Ok(Some(t)) => format!("Inspecting {t}"),
            _ => "Inspecting scene".to_string(),
        }
    }
}

/// Hold position for a duration or until a condition.
#[derive(Debug, Clone, Copy)]
pub struct Wait;

impl ActionPrimitive for Wait {
    fn id(&self) -> ActionId {
        ActionId::Wait
    }

    fn description(&self) -> &'static str {
        "Pause execution for a duration or condition"
    }

    fn schema(&self) -> PrimitiveSchema {
        PrimitiveSchema {
            id: self.id(),
            description: self.description(),
            params: vec![
                ParamSpec::optional(
                    "duration_ms",
                    ParamKind::Number {
                        min: 0.0,
                        max: 600_000.0,
                        unit: "ms",
                    },
                    Some(json!(1000)),
                    "How long to hold",
                ),
                ParamSpec::optional("condition", ParamKind::Text, None, "Condition to wait for, narrated only"),
            ],
            preconditions: vec![],
            postconditions: vec!["pose unchanged"],
            safety: SafetyFields {
                collision_check: false,
                max_velocity: None,
                timeout_ms: 600_000,
                ..SafetyFields::default()
            },
        }
    }

    fn generate_waypoints(&self, params: &Params, scene: &SceneState) -> Result<Vec<Waypoint>, PlanError> {
        // Duration is checked for shape only; the pose does not depend on it.
        f64_or(params, "duration_ms", 1000.0)?;
        Ok(vec![Waypoint::at(scene.end_effector, scene.gripper_open)])
    }

    fn validate(&self, _waypoints: &[Waypoint], _scene: &SceneState) -> Result<PrimitiveCheck, PlanError> {
        Ok(PrimitiveCheck::pass("Wait is always valid"))
    }

    fn describe(&self, params: &Params) -> String {
        if let Ok(Some(condition)) = optional_str(params, "condition") {
            return format!("Waiting for {condition}");
        }
        match params.get("duration_ms") {
            Some(d) => format!("Waiting {d}ms"),
            None => "Waiting".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::test_support::{params, tabletop};

    #[test]
    fn approach_lifts_traverses_and_descends() {
        let scene = tabletop();
        let wps = Approach
            .generate_waypoints(&params(json!({"target": "red_cube"})), &scene)
            .unwrap();

        assert_eq!(wps.len(), 3);
        // Already above table + 0.4, so the lift keeps the current height.
        assert_eq!(wps[0].y, 1.5);
        assert_eq!(wps[1].y, 1.5);
        assert!((wps[2].y - 0.60).abs() < 1e-9);
        assert_eq!((wps[2].x, wps[2].z), (0.3, 0.0));
        assert!(wps[2].gripper_open);
    }

    #[test]
    fn approach_unknown_target_is_unknown_target_error() {
        let err = Approach
            .generate_waypoints(&params(json!({"target": "ghost"})), &tabletop())
            .unwrap_err();
        assert_eq!(err, PlanError::UnknownTarget("ghost".to_string()));
    }

    #[test]
    fn approach_below_table_fails_with_waypoint_index() {
        let scene = tabletop();
        let wps = Approach
            .generate_waypoints(&params(json!({"target": "red_cube", "offset": [0, -0.2, 0]})), &scene)
            .unwrap();
        let err = Approach.validate(&wps, &scene).unwrap_err();
        assert_eq!(err.waypoint_index(), Some(2));
    }

    #[test]
    fn translate_delta_is_relative_to_end_effector() {
        let scene = tabletop();
        let wps = Translate
            .generate_waypoints(&params(json!({"delta": [0.1, -0.5, 0.0]})), &scene)
            .unwrap();
        let last = wps.last().unwrap();
        assert!((last.x - 0.1).abs() < 1e-9);
        assert!((last.y - 1.0).abs() < 1e-9);
    }

    #[test]
    fn translate_without_target_is_parameter_error() {
        let err = Translate.generate_waypoints(&Params::new(), &tabletop()).unwrap_err();
        assert!(matches!(err, PlanError::Parameter { .. }));
    }

    #[test]
    fn translate_keeps_gripper_closed_while_holding() {
        let scene = crate::primitives::test_support::holding("red_cube");
        let wps = Translate
            .generate_waypoints(&params(json!({"position": [0.0, 1.0, 0.0]})), &scene)
            .unwrap();
        assert!(wps.iter().all(|w| !w.gripper_open));
    }

    #[test]
    fn approach_inspect_and_push_keep_a_held_object() {
        let scene = crate::primitives::test_support::holding("red_cube");
        let cases = [
            Approach.generate_waypoints(&params(json!({"target": "blue_cube"})), &scene),
            Inspect.generate_waypoints(&params(json!({"target": "green_cyl"})), &scene),
            Push.generate_waypoints(
                &params(json!({"target": "blue_cube", "direction": [1, 0, 0], "distance": 0.1})),
                &scene,
            ),
        ];
        for wps in cases {
            assert!(wps.unwrap().iter().all(|w| !w.gripper_open));
        }
    }

    #[test]
    fn rotate_interpolates_one_step_per_fifteen_degrees() {
        let scene = tabletop();
        let wps = Rotate
            .generate_waypoints(&params(json!({"axis": "x", "degrees": 90})), &scene)
            .unwrap();
        assert_eq!(wps.len(), 6);
        assert!((wps[5].roll - std::f64::consts::FRAC_PI_2).abs() < 1e-9);

        let small = Rotate
            .generate_waypoints(&params(json!({"axis": "y", "degrees": 10})), &scene)
            .unwrap();
        assert_eq!(small.len(), 2);
        assert!(small[1].yaw > 0.0);
    }

    #[test]
    fn rotate_rejects_oversized_steps() {
        let scene = tabletop();
        let wps = vec![
            Waypoint::new(0.0, 1.0, 0.0, true),
            Waypoint::new(0.0, 1.0, 0.0, true).with_orientation(100f64.to_radians(), 0.0, 0.0),
        ];
        let err = Rotate.validate(&wps, &scene).unwrap_err();
        assert_eq!(err.waypoint_index(), Some(1));
    }

    #[test]
    fn push_approaches_from_opposite_side() {
        let scene = tabletop();
        let wps = Push
            .generate_waypoints(
                &params(json!({"target": "blue_cube", "direction": [2, 0, 0], "distance": 0.2})),
                &scene,
            )
            .unwrap();
        assert_eq!(wps.len(), 4);
        assert!((wps[0].x - (-0.38)).abs() < 1e-9);
        assert!((wps[2].x - (-0.1)).abs() < 1e-9);
        assert!(wps[3].gripper_open);
    }

    #[test]
    fn push_zero_direction_is_parameter_error() {
        let err = Push
            .generate_waypoints(
                &params(json!({"target": "blue_cube", "direction": [0, 0, 0], "distance": 0.2})),
                &tabletop(),
            )
            .unwrap_err();
        assert!(matches!(err, PlanError::Parameter { .. }));
    }

    #[test]
    fn inspect_looks_down_from_above_and_behind() {
        let scene = tabletop();
        let wps = Inspect
            .generate_waypoints(&params(json!({"target": "green_cyl"})), &scene)
            .unwrap();
        assert_eq!(wps.len(), 2);
        assert!((wps[0].y - 0.85).abs() < 1e-9);
        assert!((wps[0].z - (-0.45)).abs() < 1e-9);
        assert!((wps[0].pitch - (-30f64).to_radians()).abs() < 1e-9);
    }

    #[test]
    fn wait_is_stationary_and_narrates_condition() {
        let scene = tabletop();
        let wps = Wait.generate_waypoints(&Params::new(), &scene).unwrap();
        assert_eq!(wps, vec![Waypoint::at(scene.end_effector, true)]);
        assert_eq!(Wait.describe(&params(json!({"condition": "the light"}))), "Waiting for the light");
    }
}
