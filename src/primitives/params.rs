//! Parameter extraction shared by the primitives.

use serde_json::Value;

use crate::error::PlanError;
use crate::primitives::Params;
use crate::scene::{SceneObject, SceneState, Vector3D, Waypoint};

pub(crate) fn required_str<'a>(params: &'a Params, name: &str) -> Result<&'a str, PlanError> {
    optional_str(params, name)?.ok_or_else(|| PlanError::parameter(name, "is required"))
}

pub(crate) fn optional_str<'a>(params: &'a Params, name: &str) -> Result<Option<&'a str>, PlanError> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(PlanError::parameter(name, format!("expected a string, got {other}"))),
    }
}

pub(crate) fn optional_f64(params: &Params, name: &str) -> Result<Option<f64>, PlanError> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .filter(|n| n.is_finite())
            .map(Some)
            .ok_or_else(|| PlanError::parameter(name, format!("expected a number, got {v}"))),
    }
}

pub(crate) fn required_f64(params: &Params, name: &str) -> Result<f64, PlanError> {
    optional_f64(params, name)?.ok_or_else(|| PlanError::parameter(name, "is required"))
}

pub(crate) fn f64_or(params: &Params, name: &str, default: f64) -> Result<f64, PlanError> {
    Ok(optional_f64(params, name)?.unwrap_or(default))
}

pub(crate) fn bool_or(params: &Params, name: &str, default: bool) -> Result<bool, PlanError> {
    match params.get(name) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(b)) => Ok(*b),
        Some(other) => Err(PlanError::parameter(name, format!("expected a boolean, got {other}"))),
    }
}

/// Reads a `[x, y, z]` number array.
pub(crate) fn optional_vec3(params: &Params, name: &str) -> Result<Option<Vector3D>, PlanError> {
    let raw = match params.get(name) {
        None | Some(Value::Null) => return Ok(None),
        Some(v) => v,
    };
    let invalid = || PlanError::parameter(name, format!("expected [x, y, z], got {raw}"));
    let items = raw.as_array().filter(|a| a.len() == 3).ok_or_else(invalid)?;
    let mut out = [0.0; 3];
    for (slot, item) in out.iter_mut().zip(items) {
        *slot = item.as_f64().filter(|n| n.is_finite()).ok_or_else(invalid)?;
    }
    Ok(Some(out.into()))
}

pub(crate) fn required_vec3(params: &Params, name: &str) -> Result<Vector3D, PlanError> {
    optional_vec3(params, name)?.ok_or_else(|| PlanError::parameter(name, "is required"))
}

pub(crate) fn string_list<'a>(params: &'a Params, name: &str) -> Result<Vec<&'a str>, PlanError> {
    let raw = params.get(name).ok_or_else(|| PlanError::parameter(name, "is required"))?;
    let items = raw
        .as_array()
        .ok_or_else(|| PlanError::parameter(name, format!("expected a list of ids, got {raw}")))?;
    items
        .iter()
        .map(|v| {
            v.as_str()
                .ok_or_else(|| PlanError::parameter(name, format!("expected an object id, got {v}")))
        })
        .collect()
}

/// Looks up a referenced object.
pub(crate) fn object<'a>(scene: &'a SceneState, id: &str) -> Result<&'a SceneObject, PlanError> {
    scene
        .object(id)
        .ok_or_else(|| PlanError::UnknownTarget(id.to_string()))
}

/// Fails on the first waypoint below `table_height - tolerance`.
pub(crate) fn check_above_table(
    waypoints: &[Waypoint],
    scene: &SceneState,
    tolerance: f64,
    label: &str,
) -> Result<(), PlanError> {
    let floor = scene.table_height - tolerance;
    match waypoints.iter().position(|wp| !(floor..).contains(&wp.y)) {
        Some(i) => Err(PlanError::SafetyViolation {
            constraint: "table_collision".to_string(),
            reason: format!("{label} waypoint {i} below table surface (y={:.3})", waypoints[i].y),
            waypoint_index: Some(i),
        }),
        None => Ok(()),
    }
}

/// Preferred travel height: clear of the table and never lower than where we already are.
pub(crate) fn safe_height(scene: &SceneState, extra: &[f64]) -> f64 {
    extra
        .iter()
        .copied()
        .fold((scene.table_height + 0.4).max(scene.end_effector.y()), f64::max)
}

/// Gripper precondition shared by PLACE, POUR and STACK.
pub(crate) fn require_held(scene: &SceneState, verb: &str) -> Result<(), PlanError> {
    if scene.is_holding() {
        Ok(())
    } else {
        Err(PlanError::precondition(
            "no_object_held",
            format!("Cannot {verb}: no object held"),
        ))
    }
}
