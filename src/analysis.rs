//! Scene analysis: spatial relations between objects and a plain-language description.
//!
//! The description is cosmetic. It is attached to the session for the decomposition
//! collaborator and for display, and nothing downstream depends on its exact wording.

use std::fmt::{self, Write as _};

use serde::Serialize;

use crate::scene::{SceneObject, SceneState, Vector3D};

/// Within this 3D distance two objects are "near" each other (meters).
pub const NEAR_THRESHOLD: f64 = 0.3;
/// Vertical offset beyond half of this puts an object on top of another.
pub const ON_TOP_THRESHOLD: f64 = 0.15;
/// Horizontal distance under which a higher object counts as stacked.
pub const HORIZONTAL_THRESHOLD: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    OnTopOf,
    Near,
    LeftOf,
    RightOf,
    InFrontOf,
    Behind,
}

impl Relation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Relation::OnTopOf => "on top of",
            Relation::Near => "near",
            Relation::LeftOf => "left of",
            Relation::RightOf => "right of",
            Relation::InFrontOf => "in front of",
            Relation::Behind => "behind",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpatialRelation {
    pub subject: String,
    pub relation: Relation,
    pub object: String,
}

impl fmt::Display for SpatialRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is {} {}", self.subject, self.relation.as_str(), self.object)
    }
}

/// Objects, their pairwise relations and the robot state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SceneGraph {
    pub objects: Vec<SceneObject>,
    pub relations: Vec<SpatialRelation>,
    pub table_height: f64,
    pub end_effector: Vector3D,
    pub gripper_open: bool,
    pub held_object_id: Option<String>,
}

/// Pairwise relations, in object-id order.
///
/// "on top of" and "near" are exclusive for a pair; "near" is reported once per pair. The
/// lateral (x) and depth (z) relations are independent of both.
pub fn compute_spatial_relations(objects: &[SceneObject]) -> Vec<SpatialRelation> {
    let mut relations = Vec::new();
    let mut push = |a: &SceneObject, relation, b: &SceneObject| {
        relations.push(SpatialRelation {
            subject: a.id.clone(),
            relation,
            object: b.id.clone(),
        })
    };

    for (i, a) in objects.iter().enumerate() {
        for (j, b) in objects.iter().enumerate() {
            if i == j {
                continue;
            }
            let d = a.position.0 - b.position.0;
            let horizontal = (d.x * d.x + d.z * d.z).sqrt();

            if d.y > ON_TOP_THRESHOLD * 0.5 && horizontal < HORIZONTAL_THRESHOLD {
                push(a, Relation::OnTopOf, b);
            } else if d.norm() < NEAR_THRESHOLD && a.id < b.id {
                push(a, Relation::Near, b);
            }

            if d.x < -NEAR_THRESHOLD {
                push(a, Relation::LeftOf, b);
            } else if d.x > NEAR_THRESHOLD {
                push(a, Relation::RightOf, b);
            }

            if d.z < -NEAR_THRESHOLD {
                push(a, Relation::InFrontOf, b);
            } else if d.z > NEAR_THRESHOLD {
                push(a, Relation::Behind, b);
            }
        }
    }
    relations
}

pub fn analyze_scene(scene: &SceneState) -> SceneGraph {
    let objects: Vec<SceneObject> = scene.objects.values().cloned().collect();
    let relations = compute_spatial_relations(&objects);
    SceneGraph {
        objects,
        relations,
        table_height: scene.table_height,
        end_effector: scene.end_effector,
        gripper_open: scene.gripper_open,
        held_object_id: scene.held_object_id.clone(),
    }
}

impl SceneGraph {
    /// Markdown-ish description used as decomposition context.
    pub fn to_description(&self) -> String {
        let mut out = String::from("## Objects on the table:\n");
        for obj in &self.objects {
            let p = obj.position;
            let size = obj
                .size
                .iter()
                .map(|s| format!("{s:.2}"))
                .collect::<Vec<_>>()
                .join(" x ");
            let held = if obj.is_held { " [CURRENTLY HELD BY ROBOT]" } else { "" };
            let _ = writeln!(
                out,
                "- {}: {} {}, position=({:.2}, {:.2}, {:.2}), size=({size}){held}",
                obj.id,
                obj.color,
                obj.shape.as_str(),
                p.x(),
                p.y(),
                p.z()
            );
        }

        if !self.relations.is_empty() {
            out.push_str("\n## Spatial relationships:\n");
            for rel in &self.relations {
                let _ = writeln!(out, "- {rel}");
            }
        }

        let ee = self.end_effector;
        out.push_str("\n## Robot state:\n");
        let _ = writeln!(out, "- End-effector at ({:.2}, {:.2}, {:.2})", ee.x(), ee.y(), ee.z());
        let _ = writeln!(out, "- Gripper: {}", if self.gripper_open { "open" } else { "closed" });
        if let Some(held) = &self.held_object_id {
            let _ = writeln!(out, "- Holding: {held}");
        }

        let _ = write!(out, "\n## Table surface at y={:.2}", self.table_height);
        out
    }
}

/// Convenience for the pipeline's SCENE_ANALYZING stage.
pub fn describe_scene(scene: &SceneState) -> String {
    analyze_scene(scene).to_description()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::test_support::{holding, tabletop};
    use crate::scene::Shape;

    fn cube(id: &str, x: f64, y: f64, z: f64) -> SceneObject {
        SceneObject::new(id, Shape::Box, "red", Vector3D::new(x, y, z), vec![0.1, 0.1, 0.1])
    }

    #[test]
    fn stacked_object_is_on_top_not_near() {
        let objects = [cube("a", 0.0, 0.65, 0.0), cube("b", 0.02, 0.55, 0.0)];
        let relations = compute_spatial_relations(&objects);
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].to_string(), "a is on top of b");
    }

    #[test]
    fn near_is_reported_once_per_pair() {
        let objects = [cube("b", 0.1, 0.55, 0.0), cube("a", 0.0, 0.55, 0.0)];
        let relations = compute_spatial_relations(&objects);
        assert_eq!(relations.len(), 1);
        assert_eq!((relations[0].subject.as_str(), relations[0].relation), ("a", Relation::Near));
    }

    #[test]
    fn lateral_and_depth_relations() {
        let objects = [cube("a", -0.5, 0.55, -0.5), cube("b", 0.5, 0.55, 0.5)];
        let names: Vec<String> = compute_spatial_relations(&objects).iter().map(ToString::to_string).collect();
        assert_eq!(
            names,
            ["a is left of b", "a is in front of b", "b is right of a", "b is behind a"]
        );
    }

    #[test]
    fn description_has_all_sections() {
        let text = describe_scene(&tabletop());
        assert!(text.starts_with("## Objects on the table:\n- blue_cube: blue box"));
        assert!(text.contains("## Spatial relationships:"));
        assert!(text.contains("- Gripper: open"));
        assert!(text.ends_with("## Table surface at y=0.50"));
        assert!(!text.contains("Holding"));
    }

    #[test]
    fn description_marks_held_object() {
        let text = describe_scene(&holding("red_cube"));
        assert!(text.contains("red_cube: red box, position=(0.30, 0.55, 0.00), size=(0.10 x 0.10 x 0.10) [CURRENTLY HELD BY ROBOT]"));
        assert!(text.contains("- Holding: red_cube"));
        assert!(text.contains("- Gripper: closed"));
    }
}
