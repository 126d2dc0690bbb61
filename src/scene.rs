//! Scene model primitives.
//!
//! The scene is the world state every other component reads: manipulable objects, the
//! end-effector position and the gripper. A [`SceneState`] is owned by one pipeline session;
//! the trajectory planner works on its own copy and is the only component that evolves it.

use std::collections::BTreeMap;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::error::SceneError;

/// Default end-effector rest position.
pub const DEFAULT_END_EFFECTOR: [f64; 3] = [0.0, 1.5, 0.0];

/// Default table surface height (meters).
pub const DEFAULT_TABLE_HEIGHT: f64 = 0.5;

/// A simple 3D coordinate wrapper.
///
/// Internally uses [`nalgebra::Vector3<f64>`] for downstream math convenience. Serializes as a
/// plain `[x, y, z]` array.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 3]", into = "[f64; 3]")]
pub struct Vector3D(pub Vector3<f64>);

impl Vector3D {
    /// Convenience constructor.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self(Vector3::new(x, y, z))
    }

    pub fn x(&self) -> f64 {
        self.0.x
    }

    pub fn y(&self) -> f64 {
        self.0.y
    }

    pub fn z(&self) -> f64 {
        self.0.z
    }

    /// Euclidean distance to another point.
    pub fn distance(&self, other: &Vector3D) -> f64 {
        (self.0 - other.0).norm()
    }
}

impl From<[f64; 3]> for Vector3D {
    fn from(v: [f64; 3]) -> Self {
        Self::new(v[0], v[1], v[2])
    }
}

impl From<Vector3D> for [f64; 3] {
    fn from(v: Vector3D) -> Self {
        [v.x(), v.y(), v.z()]
    }
}

/// A single end-effector pose the arm must pass through.
///
/// Positions are meters, orientation is radians. Waypoints are plain values; nothing mutates
/// one after it is generated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub roll: f64,
    #[serde(default)]
    pub pitch: f64,
    #[serde(default)]
    pub yaw: f64,
    #[serde(default = "default_true")]
    pub gripper_open: bool,
}

impl Waypoint {
    /// A waypoint with neutral orientation.
    pub fn new(x: f64, y: f64, z: f64, gripper_open: bool) -> Self {
        Self {
            x,
            y,
            z,
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
            gripper_open,
        }
    }

    /// A waypoint at `position` with neutral orientation.
    pub fn at(position: Vector3D, gripper_open: bool) -> Self {
        Self::new(position.x(), position.y(), position.z(), gripper_open)
    }

    pub fn with_orientation(mut self, roll: f64, pitch: f64, yaw: f64) -> Self {
        self.roll = roll;
        self.pitch = pitch;
        self.yaw = yaw;
        self
    }

    pub fn position(&self) -> Vector3D {
        Vector3D::new(self.x, self.y, self.z)
    }

    /// Orientation as a (roll, pitch, yaw) vector.
    pub fn orientation(&self) -> Vector3<f64> {
        Vector3::new(self.roll, self.pitch, self.yaw)
    }
}

fn default_true() -> bool {
    true
}

/// Object geometry class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    #[default]
    Box,
    Cylinder,
    Sphere,
}

impl Shape {
    pub const fn as_str(self) -> &'static str {
        match self {
            Shape::Box => "box",
            Shape::Cylinder => "cylinder",
            Shape::Sphere => "sphere",
        }
    }
}

/// A manipulable object on the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneObject {
    pub id: String,
    #[serde(default)]
    pub shape: Shape,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default = "origin")]
    pub position: Vector3D,
    /// Shape-dependent extents: `[w, h, d]` for boxes, `[diameter, h]` for cylinders,
    /// `[diameter]` for spheres.
    #[serde(default = "default_size")]
    pub size: Vec<f64>,
    #[serde(default)]
    pub mass: f64,
    #[serde(default)]
    pub is_held: bool,
}

fn default_color() -> String {
    "unknown".to_string()
}

fn origin() -> Vector3D {
    Vector3D::new(0.0, 0.0, 0.0)
}

fn default_size() -> Vec<f64> {
    vec![0.1]
}

impl SceneObject {
    pub fn new(id: impl Into<String>, shape: Shape, color: impl Into<String>, position: Vector3D, size: Vec<f64>) -> Self {
        Self {
            id: id.into(),
            shape,
            color: color.into(),
            position,
            size,
            mass: 0.0,
            is_held: false,
        }
    }

    /// Vertical extent: the second size component when present, otherwise the first.
    pub fn height(&self) -> f64 {
        self.size
            .get(1)
            .or_else(|| self.size.first())
            .copied()
            .unwrap_or(0.0)
    }

    /// Conservative bounding-sphere radius.
    pub fn bounding_radius(&self) -> f64 {
        self.size
            .iter()
            .copied()
            .reduce(f64::max)
            .map(|m| m / 2.0)
            .unwrap_or(0.1)
    }
}

/// World state as seen by one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SceneDocument", into = "SceneDocument")]
pub struct SceneState {
    /// Objects keyed by id. Ordered so that every scan over the scene is deterministic.
    pub objects: BTreeMap<String, SceneObject>,
    pub end_effector: Vector3D,
    pub gripper_open: bool,
    pub held_object_id: Option<String>,
    pub table_height: f64,
}

impl Default for SceneState {
    fn default() -> Self {
        Self {
            objects: BTreeMap::new(),
            end_effector: DEFAULT_END_EFFECTOR.into(),
            gripper_open: true,
            held_object_id: None,
            table_height: DEFAULT_TABLE_HEIGHT,
        }
    }
}

impl SceneState {
    /// An empty scene with the given table height.
    pub fn with_table_height(table_height: f64) -> Self {
        Self {
            table_height,
            ..Self::default()
        }
    }

    /// Parses the JSON scene document sent by a client.
    pub fn from_json_str(raw: &str) -> Result<Self, SceneError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Adds an object, rejecting duplicate ids.
    pub fn insert_object(&mut self, object: SceneObject) -> Result<(), SceneError> {
        if self.objects.contains_key(&object.id) {
            return Err(SceneError::DuplicateObject(object.id));
        }
        self.objects.insert(object.id.clone(), object);
        Ok(())
    }

    /// Builder form of [`SceneState::insert_object`].
    pub fn with_object(mut self, object: SceneObject) -> Result<Self, SceneError> {
        self.insert_object(object)?;
        Ok(self)
    }

    pub fn object(&self, id: &str) -> Option<&SceneObject> {
        self.objects.get(id)
    }

    pub fn is_holding(&self) -> bool {
        self.held_object_id.is_some()
    }

    /// Marks `id` as held and closes the gripper.
    pub fn grasp(&mut self, id: &str) -> Result<(), SceneError> {
        let obj = self
            .objects
            .get_mut(id)
            .ok_or_else(|| SceneError::HeldObjectMissing(id.to_string()))?;
        obj.is_held = true;
        self.held_object_id = Some(id.to_string());
        self.gripper_open = false;
        Ok(())
    }

    /// Releases whatever is held, leaving it at `at` when given. Returns the released id.
    pub fn release(&mut self, at: Option<Vector3D>) -> Option<String> {
        let released = self.held_object_id.take();
        if let Some(obj) = released.as_ref().and_then(|id| self.objects.get_mut(id)) {
            obj.is_held = false;
            if let Some(pos) = at {
                obj.position = pos;
            }
        }
        self.gripper_open = true;
        released
    }

    /// Verifies the holding invariants: a held id names an existing object flagged as held,
    /// the gripper is closed around it, and no other object claims to be held.
    pub fn check_consistency(&self) -> Result<(), SceneError> {
        if let Some(id) = &self.held_object_id {
            let obj = self
                .objects
                .get(id)
                .ok_or_else(|| SceneError::HeldObjectMissing(id.clone()))?;
            if !obj.is_held {
                return Err(SceneError::HeldFlagMismatch(id.clone()));
            }
            if self.gripper_open {
                return Err(SceneError::GripperOpenWhileHolding(id.clone()));
            }
        }

        let stray = self
            .objects
            .values()
            .find(|o| o.is_held && self.held_object_id.as_deref() != Some(o.id.as_str()));
        match stray {
            Some(o) => Err(SceneError::HeldFlagMismatch(o.id.clone())),
            None => Ok(()),
        }
    }
}

/// Wire form of [`SceneState`]: objects arrive as a list.
#[derive(Debug, Serialize, Deserialize)]
struct SceneDocument {
    #[serde(default)]
    objects: Vec<SceneObject>,
    #[serde(default = "default_end_effector")]
    end_effector: Vector3D,
    #[serde(default = "default_true")]
    gripper_open: bool,
    #[serde(default)]
    held_object_id: Option<String>,
    #[serde(default = "default_table_height")]
    table_height: f64,
}

fn default_end_effector() -> Vector3D {
    DEFAULT_END_EFFECTOR.into()
}

fn default_table_height() -> f64 {
    DEFAULT_TABLE_HEIGHT
}

impl TryFrom<SceneDocument> for SceneState {
    type Error = SceneError;

    fn try_from(doc: SceneDocument) -> Result<Self, Self::Error> {
        let mut scene = SceneState {
            objects: BTreeMap::new(),
            end_effector: doc.end_effector,
            gripper_open: doc.gripper_open,
            held_object_id: doc.held_object_id,
            table_height: doc.table_height,
        };
        for obj in doc.objects {
            scene.insert_object(obj)?;
        }
        scene.check_consistency()?;
        Ok(scene)
    }
}

impl From<SceneState> for SceneDocument {
    fn from(scene: SceneState) -> Self {
        Self {
            objects: scene.objects.into_values().collect(),
            end_effector: scene.end_effector,
            gripper_open: scene.gripper_open,
            held_object_id: scene.held_object_id,
            table_height: scene.table_height,
        }
    }
}
