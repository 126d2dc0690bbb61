//! Primitives that pick up, set down or otherwise work with a held object.

use std::cmp::Ordering;

use serde_json::json;

use crate::error::PlanError;
use crate::primitives::params::{
    bool_or, check_above_table, f64_or, object, optional_str, optional_vec3, require_held, required_str,
    string_list,
};
use crate::primitives::schema::{ParamKind, ParamSpec, PrimitiveSchema, SafetyFields};
use crate::primitives::{ActionId, ActionPrimitive, Params, PrimitiveCheck};
use crate::scene::{SceneObject, SceneState, Vector3D, Waypoint};

/// Clearance added above a support surface when setting an object down.
const DROP_CLEARANCE: f64 = 0.05;
/// Height above the stack point for the approach and retreat waypoints.
const STACK_RETREAT: f64 = 0.25;
const POUR_HEIGHT: f64 = 0.3;
const POUR_STEP_DEG: f64 = 20.0;
const SORT_SPACING: f64 = 0.3;
const COLOR_ORDER: [&str; 6] = ["red", "green", "blue", "yellow", "purple", "orange"];

/// Close the gripper on a target object.
#[derive(Debug, Clone, Copy)]
pub struct Grasp;

impl ActionPrimitive for Grasp {
    fn id(&self) -> ActionId {
        ActionId::Grasp
    }

    fn description(&self) -> &'static str {
        "Close gripper to grasp a target object"
    }

    fn schema(&self) -> PrimitiveSchema {
        PrimitiveSchema {
            id: self.id(),
            description: self.description(),
            params: vec![ParamSpec::required("target", ParamKind::ObjectId, "Object to grasp")],
            preconditions: vec!["target exists in scene", "gripper is empty"],
            postconditions: vec!["target held", "gripper closed"],
            safety: SafetyFields {
                max_velocity: Some(0.2),
                max_force: Some(20.0),
                stability_check: true,
                ..SafetyFields::default()
            },
        }
    }

    fn generate_waypoints(&self, params: &Params, scene: &SceneState) -> Result<Vec<Waypoint>, PlanError> {
        let obj = object(scene, required_str(params, "target")?)?;
        Ok(vec![Waypoint::at(obj.position, true), Waypoint::at(obj.position, false)])
    }

    fn validate(&self, _waypoints: &[Waypoint], scene: &SceneState) -> Result<PrimitiveCheck, PlanError> {
        if let Some(held) = &scene.held_object_id {
            return Err(PlanError::precondition(
                "gripper_occupied",
                format!("Already holding object '{held}'"),
            ));
        }
        Ok(PrimitiveCheck::pass("Grasp valid"))
    }

    fn describe(&self, params: &Params) -> String {
        match optional_str(params, "target") {
            Ok(Some(t)) => format!("Grasping {t}"),
            _ => "Grasping object".to_string(),
        }
    }
}

/// Open the gripper where it is.
#[derive(Debug, Clone, Copy)]
pub struct Release;

impl ActionPrimitive for Release {
    fn id(&self) -> ActionId {
        ActionId::Release
    }

    fn description(&self) -> &'static str {
        "Open gripper to release held object"
    }

    fn schema(&self) -> PrimitiveSchema {
        PrimitiveSchema {
            id: self.id(),
            description: self.description(),
            params: vec![],
            preconditions: vec!["an object is held (otherwise a no-op warning)"],
            postconditions: vec!["gripper open", "nothing held"],
            safety: SafetyFields {
                collision_check: false,
                max_velocity: None,
                timeout_ms: 2_000,
                ..SafetyFields::default()
            },
        }
    }

    fn generate_waypoints(&self, _params: &Params, scene: &SceneState) -> Result<Vec<Waypoint>, PlanError> {
        Ok(vec![Waypoint::at(scene.end_effector, true)])
    }

    fn validate(&self, _waypoints: &[Waypoint], scene: &SceneState) -> Result<PrimitiveCheck, PlanError> {
        if !scene.is_holding() {
            return Ok(PrimitiveCheck::Warning {
                constraint: "no_object_held",
                reason: "No object currently held; release is a no-op".to_string(),
            });
        }
        Ok(PrimitiveCheck::pass("Release valid"))
    }

    fn describe(&self, _params: &Params) -> String {
        "Releasing object".to_string()
    }
}

/// Set the held object down: above, gentle descent, release, retreat.
#[derive(Debug, Clone, Copy)]
pub struct Place;

impl ActionPrimitive for Place {
    fn id(&self) -> ActionId {
        ActionId::Place
    }

    fn description(&self) -> &'static str {
        "Place held object at a target location"
    }

    fn schema(&self) -> PrimitiveSchema {
        PrimitiveSchema {
            id: self.id(),
            description: self.description(),
            params: vec![
                ParamSpec::optional("position", ParamKind::Vec3, None, "Placement point (m)"),
                ParamSpec::optional("target", ParamKind::ObjectId, None, "Object to place on top of"),
                ParamSpec::optional("gentle", ParamKind::Bool, Some(json!(true)), "Stop 2 cm above instead of 5 cm"),
            ],
            preconditions: vec!["an object is held", "target, if given, is not the held object"],
            postconditions: vec!["object rests at placement point", "gripper open"],
            safety: SafetyFields {
                max_velocity: Some(0.3),
                stability_check: true,
                ..SafetyFields::default()
            },
        }
    }

    fn generate_waypoints(&self, params: &Params, scene: &SceneState) -> Result<Vec<Waypoint>, PlanError> {
        let target = match (optional_vec3(params, "position")?, optional_str(params, "target")?) {
            (Some(position), _) => position,
            (None, Some(id)) => {
                let support = object(scene, id)?;
                if scene.held_object_id.as_deref() == Some(id) {
                    return Err(PlanError::precondition(
                        "place_on_self",
                        format!("Cannot place '{id}' on itself"),
                    ));
                }
                let p = support.position;
                Vector3D::new(p.x(), p.y() + support.height() / 2.0 + DROP_CLEARANCE, p.z())
            }
            (None, None) => Vector3D::new(
                scene.end_effector.x(),
                scene.table_height + DROP_CLEARANCE,
                scene.end_effector.z(),
            ),
        };

        let gentle = bool_or(params, "gentle", true)?;
        let safe_y = (scene.table_height + 0.4).max(target.y() + 0.2);
        let descent_y = target.y() + if gentle { 0.02 } else { 0.05 };

        Ok(vec![
            Waypoint::new(target.x(), safe_y, target.z(), false),
            Waypoint::new(target.x(), descent_y, target.z(), false),
            Waypoint::new(target.x(), descent_y, target.z(), true),
            Waypoint::new(target.x(), safe_y, target.z(), true),
        ])
    }

    fn validate(&self, waypoints: &[Waypoint], scene: &SceneState) -> Result<PrimitiveCheck, PlanError> {
        require_held(scene, "place")?;
        check_above_table(waypoints, scene, 0.01, "Placement")?;
        Ok(PrimitiveCheck::pass("Placement valid"))
    }

    fn describe(&self, params: &Params) -> String {
        if let Ok(Some(t)) = optional_str(params, "target") {
            return format!("Placing object on {t}");
        }
        if let Ok(Some(p)) = optional_vec3(params, "position") {
            return format!("Placing object at ({:.2}, {:.2}, {:.2})", p.x(), p.y(), p.z());
        }
        "Placing object".to_string()
    }
}

/// Tilt a held container over a target container, hold, and come back upright.
#[derive(Debug, Clone, Copy)]
pub struct Pour;

impl ActionPrimitive for Pour {
    fn id(&self) -> ActionId {
        ActionId::Pour
    }

    fn description(&self) -> &'static str {
        "Tilt a grasped container to pour contents"
    }

    fn schema(&self) -> PrimitiveSchema {
        PrimitiveSchema {
            id: self.id(),
            description: self.description(),
            params: vec![
                ParamSpec::required("target_container", ParamKind::ObjectId, "Container to pour into"),
                ParamSpec::optional(
                    "angle",
                    ParamKind::Number {
                        min: 0.0,
                        max: 180.0,
                        unit: "deg",
                    },
                    Some(json!(90)),
                    "Tilt angle",
                ),
            ],
            preconditions: vec!["a container is held", "target_container exists in scene"],
            postconditions: vec!["held container upright above target"],
            safety: SafetyFields {
                max_velocity: Some(0.2),
                stability_check: true,
                timeout_ms: 15_000,
                ..SafetyFields::default()
            },
        }
    }

    fn generate_waypoints(&self, params: &Params, scene: &SceneState) -> Result<Vec<Waypoint>, PlanError> {
        let container = object(scene, required_str(params, "target_container")?)?;
        let angle = f64_or(params, "angle", 90.0)?;
        let p = container.position;
        let above = Waypoint::new(p.x(), p.y() + POUR_HEIGHT, p.z(), false);

        let steps = ((angle / POUR_STEP_DEG) as usize).max(3);
        let mut waypoints = Vec::with_capacity(steps + 3);
        waypoints.push(above);
        waypoints.extend((1..=steps).map(|i| {
            let t = i as f64 / steps as f64;
            above.with_orientation((angle * t).to_radians(), 0.0, 0.0)
        }));
        waypoints.push(above.with_orientation(angle.to_radians(), 0.0, 0.0));
        waypoints.push(above);
        Ok(waypoints)
    }

    fn validate(&self, _waypoints: &[Waypoint], scene: &SceneState) -> Result<PrimitiveCheck, PlanError> {
        require_held(scene, "pour")?;
        Ok(PrimitiveCheck::pass("Pour trajectory valid"))
    }

    fn describe(&self, params: &Params) -> String {
        if params.is_empty() {
            return "Pouring".to_string();
        }
        let target = params.get("target_container").and_then(|v| v.as_str()).unwrap_or("container");
        match params.get("angle") {
            Some(angle) => format!("Pouring into {target} at {angle}°"),
            None => format!("Pouring into {target} at 90°"),
        }
    }
}

/// Put the held object on top of another object.
#[derive(Debug, Clone, Copy)]
pub struct Stack;

impl Stack {
    /// Release height on top of `target`.
    pub fn stack_height(target: &SceneObject) -> f64 {
        target.position.y() + target.height() / 2.0 + DROP_CLEARANCE
    }
}

impl ActionPrimitive for Stack {
    fn id(&self) -> ActionId {
        ActionId::Stack
    }

    fn description(&self) -> &'static str {
        "Place held object on top of a target object"
    }

    fn schema(&self) -> PrimitiveSchema {
        PrimitiveSchema {
            id: self.id(),
            description: self.description(),
            params: vec![ParamSpec::required("target", ParamKind::ObjectId, "Object to stack onto")],
            preconditions: vec!["an object is held", "target exists and is not the held object"],
            postconditions: vec!["held object rests on target", "gripper open"],
            safety: SafetyFields {
                max_velocity: Some(0.3),
                stability_check: true,
                ..SafetyFields::default()
            },
        }
    }

    fn generate_waypoints(&self, params: &Params, scene: &SceneState) -> Result<Vec<Waypoint>, PlanError> {
        let target_id = required_str(params, "target")?;
        let target = object(scene, target_id)?;
        if scene.held_object_id.as_deref() == Some(target_id) {
            return Err(PlanError::precondition(
                "stack_on_self",
                format!("Cannot stack '{target_id}' on itself"),
            ));
        }

        let stack_y = Self::stack_height(target);
        let safe_y = stack_y + STACK_RETREAT;
        let (x, z) = (target.position.x(), target.position.z());

        Ok(vec![
            Waypoint::new(x, safe_y, z, false),
            Waypoint::new(x, stack_y, z, false),
            Waypoint::new(x, stack_y, z, true),
            Waypoint::new(x, safe_y, z, true),
        ])
    }

    fn validate(&self, _waypoints: &[Waypoint], scene: &SceneState) -> Result<PrimitiveCheck, PlanError> {
        require_held(scene, "stack")?;
        Ok(PrimitiveCheck::pass("Stack trajectory valid"))
    }

    fn describe(&self, params: &Params) -> String {
        match optional_str(params, "target") {
            Ok(Some(t)) => format!("Stacking object on {t}"),
            _ => "Stacking object".to_string(),
        }
    }
}

/// Pick each listed object and lay them out in a line, ordered by a criterion.
#[derive(Debug, Clone, Copy)]
pub struct Sort;

fn color_rank(color: &str) -> usize {
    COLOR_ORDER
        .iter()
        .position(|c| c.eq_ignore_ascii_case(color))
        .unwrap_or(COLOR_ORDER.len())
}

impl ActionPrimitive for Sort {
    fn id(&self) -> ActionId {
        ActionId::Sort
    }

    fn description(&self) -> &'static str {
        "Arrange multiple objects by a criterion"
    }

    fn schema(&self) -> PrimitiveSchema {
        PrimitiveSchema {
            id: self.id(),
            description: self.description(),
            params: vec![
                ParamSpec::required("objects", ParamKind::ObjectIdList, "Objects to arrange"),
                ParamSpec::optional(
                    "criterion",
                    ParamKind::Enum {
                        values: &["position", "color", "size"],
                    },
                    Some(json!("position")),
                    "Ordering key",
                ),
                ParamSpec::optional(
                    "direction",
                    ParamKind::Enum {
                        values: &["left_to_right", "right_to_left", "front_to_back", "back_to_front"],
                    },
                    Some(json!("left_to_right")),
                    "Layout direction",
                ),
            ],
            preconditions: vec!["all objects exist in scene", "gripper is empty"],
            postconditions: vec!["objects in a line at 0.3 m spacing", "gripper open"],
            safety: SafetyFields {
                stability_check: true,
                timeout_ms: 60_000,
                ..SafetyFields::default()
            },
        }
    }

    fn generate_waypoints(&self, params: &Params, scene: &SceneState) -> Result<Vec<Waypoint>, PlanError> {
        let mut objects = string_list(params, "objects")?
            .into_iter()
            .map(|id| object(scene, id))
            .collect::<Result<Vec<_>, _>>()?;
        let criterion = optional_str(params, "criterion")?.unwrap_or("position");
        let direction = optional_str(params, "direction")?.unwrap_or("left_to_right");

        match criterion {
            "color" => objects.sort_by_key(|o| color_rank(&o.color)),
            "size" => objects.sort_by(|a, b| {
                let (sa, sb) = (a.size.first().copied().unwrap_or(0.0), b.size.first().copied().unwrap_or(0.0));
                sa.partial_cmp(&sb).unwrap_or(Ordering::Equal)
            }),
            _ => objects.sort_by(|a, b| a.position.x().total_cmp(&b.position.x())),
        }
        if matches!(direction, "right_to_left" | "back_to_front") {
            objects.reverse();
        }
        let along_x = matches!(direction, "left_to_right" | "right_to_left");

        let start = -SORT_SPACING * (objects.len().saturating_sub(1)) as f64 / 2.0;
        let place_y = scene.table_height + 0.1;
        let safe_y = scene.table_height + 0.4;

        let mut waypoints = Vec::with_capacity(objects.len() * 8);
        for (i, obj) in objects.iter().enumerate() {
            let slot = start + i as f64 * SORT_SPACING;
            let (px, pz) = if along_x { (slot, 0.0) } else { (0.0, slot) };
            let p = obj.position;
            waypoints.extend([
                Waypoint::new(p.x(), safe_y, p.z(), true),
                Waypoint::new(p.x(), p.y(), p.z(), true),
                Waypoint::new(p.x(), p.y(), p.z(), false),
                Waypoint::new(p.x(), safe_y, p.z(), false),
                Waypoint::new(px, safe_y, pz, false),
                Waypoint::new(px, place_y, pz, false),
                Waypoint::new(px, place_y, pz, true),
                Waypoint::new(px, safe_y, pz, true),
            ]);
        }
        Ok(waypoints)
    }

    fn validate(&self, waypoints: &[Waypoint], scene: &SceneState) -> Result<PrimitiveCheck, PlanError> {
        if let Some(held) = &scene.held_object_id {
            return Err(PlanError::precondition(
                "gripper_occupied",
                format!("Cannot sort while holding object '{held}'"),
            ));
        }
        check_above_table(waypoints, scene, 0.01, "Sort")?;
        Ok(PrimitiveCheck::pass("Sort trajectory valid"))
    }

    fn describe(&self, params: &Params) -> String {
        if params.is_empty() {
            return "Sorting objects".to_string();
        }
        let criterion = params.get("criterion").and_then(|v| v.as_str()).unwrap_or("position");
        let direction = params.get("direction").and_then(|v| v.as_str()).unwrap_or("left_to_right");
        format!("Sorting objects by {criterion}, {}", direction.replace('_', " "))
    }
}
