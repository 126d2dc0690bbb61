//! Trajectory safety validator.
//!
//! A pure function over a full waypoint sequence. Every check runs independently and
//! reports every offending waypoint; hard limits become violations, soft ones warnings.
//! Checks pass only when a value is provably within its limit, so non-finite coordinates fail.
//! Nothing here mutates the scene or the waypoints, so validating the same input twice
//! yields the same result.

use serde::Serialize;

use crate::config::SafetyConfig;
use crate::scene::{SceneState, Waypoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// One broken constraint at one waypoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub constraint: &'static str,
    pub severity: Severity,
    pub message: String,
    /// `None` only for sequence-level problems such as an empty trajectory.
    pub waypoint_index: Option<usize>,
}

impl Violation {
    fn error(constraint: &'static str, index: usize, message: String) -> Self {
        Self {
            constraint,
            severity: Severity::Error,
            message,
            waypoint_index: Some(index),
        }
    }

    fn warning(constraint: &'static str, index: usize, message: String) -> Self {
        Self {
            constraint,
            severity: Severity::Warning,
            message,
            waypoint_index: Some(index),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyValidationResult {
    pub is_safe: bool,
    pub violations: Vec<Violation>,
    pub warnings: Vec<Violation>,
    pub summary: String,
}

impl SafetyValidationResult {
    /// Index of the first hard violation tied to a waypoint.
    pub fn first_violation_index(&self) -> Option<usize> {
        self.violations.iter().find_map(|v| v.waypoint_index)
    }
}

pub fn check_workspace_bounds(waypoints: &[Waypoint], config: &SafetyConfig) -> Vec<Violation> {
    let ws = &config.workspace;
    let mut out = Vec::new();
    for (i, wp) in waypoints.iter().enumerate() {
        let axes = [
            ("workspace_bounds_x", "x", wp.x, ws.x_min, ws.x_max),
            ("workspace_bounds_y", "y", wp.y, ws.y_min, ws.y_max),
            ("workspace_bounds_z", "z", wp.z, ws.z_min, ws.z_max),
        ];
        for (constraint, axis, value, min, max) in axes {
            if !(min..=max).contains(&value) {
                out.push(Violation::error(
                    constraint,
                    i,
                    format!("Waypoint {i}: {axis}={value:.3} outside [{min}, {max}]"),
                ));
            }
        }
    }
    out
}

pub fn check_table_collision(waypoints: &[Waypoint], config: &SafetyConfig) -> Vec<Violation> {
    let floor = config.table_height - config.collision_margin;
    waypoints
        .iter()
        .enumerate()
        .filter(|(_, wp)| !(floor..).contains(&wp.y))
        .map(|(i, wp)| {
            Violation::error(
                "table_collision",
                i,
                format!(
                    "Waypoint {i}: y={:.3} below table surface at {:.3}",
                    wp.y, config.table_height
                ),
            )
        })
        .collect()
}

/// Linear velocity of each adjacent pair, indexed by the later waypoint.
pub fn pair_velocities<'a>(
    waypoints: &'a [Waypoint],
    config: &'a SafetyConfig,
) -> impl Iterator<Item = (usize, f64)> + 'a {
    waypoints
        .windows(2)
        .enumerate()
        .map(move |(i, pair)| (i + 1, pair[0].position().distance(&pair[1].position()) / config.assumed_dt))
}

/// Highest adjacent-pair velocity, `0.0` for fewer than two waypoints.
pub fn max_pair_velocity(waypoints: &[Waypoint], config: &SafetyConfig) -> f64 {
    pair_velocities(waypoints, config).map(|(_, v)| v).fold(0.0, f64::max)
}

pub fn check_linear_velocity(waypoints: &[Waypoint], config: &SafetyConfig) -> Vec<Violation> {
    let max = config.max_linear_velocity;
    pair_velocities(waypoints, config)
        .filter(|&(_, velocity)| !(..=max).contains(&velocity))
        .map(|(i, velocity)| {
            Violation::error(
                "max_linear_velocity",
                i,
                format!(
                    "Waypoint {i}: linear velocity {velocity:.3} m/s exceeds limit {max:.3} m/s (dt {}s)",
                    config.assumed_dt
                ),
            )
        })
        .collect()
}

/// Combined orientation change per pair, as the norm of the (roll, pitch, yaw) delta.
pub fn check_angular_velocity(waypoints: &[Waypoint], config: &SafetyConfig) -> Vec<Violation> {
    let max = config.max_angular_velocity;
    waypoints
        .windows(2)
        .enumerate()
        .filter_map(|(i, pair)| {
            let rate = (pair[1].orientation() - pair[0].orientation()).norm() / config.assumed_dt;
            (!(..=max).contains(&rate)).then(|| {
                Violation::error(
                    "max_angular_velocity",
                    i + 1,
                    format!(
                        "Waypoint {}: angular velocity {:.1} °/s exceeds limit {:.1} °/s",
                        i + 1,
                        rate.to_degrees(),
                        max.to_degrees()
                    ),
                )
            })
        })
        .collect()
}

pub fn check_waypoint_distance(waypoints: &[Waypoint], config: &SafetyConfig) -> Vec<Violation> {
    let max = config.max_waypoint_distance;
    waypoints
        .windows(2)
        .enumerate()
        .filter_map(|(i, pair)| {
            let dist = pair[0].position().distance(&pair[1].position());
            (!(..=max).contains(&dist)).then(|| {
                Violation::error(
                    "max_waypoint_distance",
                    i + 1,
                    format!("Waypoint {}: distance {dist:.3}m from previous exceeds max {max:.3}m", i + 1),
                )
            })
        })
        .collect()
}

/// Soft check: bounding-sphere clearance from every object except the held one.
pub fn check_obstacle_clearance(waypoints: &[Waypoint], scene: &SceneState, config: &SafetyConfig) -> Vec<Violation> {
    let min = config.min_obstacle_clearance;
    let mut out = Vec::new();
    for (i, wp) in waypoints.iter().enumerate() {
        let p = wp.position();
        for obj in scene.objects.values() {
            if scene.held_object_id.as_deref() == Some(obj.id.as_str()) {
                continue;
            }
            let clearance = p.distance(&obj.position) - obj.bounding_radius();
            if !(min..).contains(&clearance) {
                out.push(Violation::warning(
                    "obstacle_clearance",
                    i,
                    format!(
                        "Waypoint {i}: clearance {clearance:.3}m from '{}' below minimum {min:.3}m",
                        obj.id
                    ),
                ));
            }
        }
    }
    out
}

/// Runs every check over `waypoints`. Obstacle clearance is only checked when a scene is given.
pub fn validate_trajectory(
    waypoints: &[Waypoint],
    scene: Option<&SceneState>,
    config: &SafetyConfig,
) -> SafetyValidationResult {
    if waypoints.is_empty() {
        return SafetyValidationResult {
            is_safe: false,
            violations: vec![Violation {
                constraint: "empty_trajectory",
                severity: Severity::Error,
                message: "No waypoints provided".to_string(),
                waypoint_index: None,
            }],
            warnings: Vec::new(),
            summary: "Trajectory is empty".to_string(),
        };
    }

    let mut issues = check_workspace_bounds(waypoints, config);
    issues.extend(check_table_collision(waypoints, config));
    issues.extend(check_linear_velocity(waypoints, config));
    issues.extend(check_angular_velocity(waypoints, config));
    issues.extend(check_waypoint_distance(waypoints, config));
    if let Some(scene) = scene {
        issues.extend(check_obstacle_clearance(waypoints, scene, config));
    }

    let (violations, warnings): (Vec<_>, Vec<_>) = issues.into_iter().partition(|v| v.severity == Severity::Error);
    let is_safe = violations.is_empty();

    let summary = match violations.first() {
        Some(first) => format!(
            "Trajectory UNSAFE: {} violation(s). First: {}",
            violations.len(),
            first.message
        ),
        None if warnings.is_empty() => format!(
            "Trajectory valid: {} waypoints passed all safety checks",
            waypoints.len()
        ),
        None => format!(
            "Trajectory valid with {} warning(s): {}",
            warnings.len(),
            warnings.iter().take(3).map(|w| w.message.as_str()).collect::<Vec<_>>().join("; ")
        ),
    };

    SafetyValidationResult {
        is_safe,
        violations,
        warnings,
        summary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkspaceBounds;
    use crate::scene::{SceneObject, Shape, Vector3D};
    use proptest::prelude::*;

    fn wide_config(max_linear_velocity: f64, assumed_dt: f64) -> SafetyConfig {
        SafetyConfig {
            workspace: WorkspaceBounds {
                x_min: -20.0,
                x_max: 20.0,
                y_min: 0.0,
                y_max: 20.0,
                z_min: -20.0,
                z_max: 20.0,
            },
            max_linear_velocity,
            assumed_dt,
            max_waypoint_distance: 50.0,
            ..SafetyConfig::default()
        }
    }

    #[test]
    fn velocity_limit_is_inclusive() {
        let config = wide_config(2.5, 2.0);
        let start = Waypoint::new(0.0, 1.0, 0.0, true);

        let at_limit = [start, Waypoint::new(5.0, 1.0, 0.0, true)];
        let result = validate_trajectory(&at_limit, None, &config);
        assert!(result.is_safe, "{}", result.summary);

        let over = [start, Waypoint::new(5.1, 1.0, 0.0, true)];
        let result = validate_trajectory(&over, None, &config);
        assert!(!result.is_safe);
        assert_eq!(result.violations[0].constraint, "max_linear_velocity");
        assert_eq!(result.violations[0].waypoint_index, Some(1));
    }

    #[test]
    fn table_boundary_uses_margin() {
        let config = SafetyConfig::default();
        let floor = config.table_height - config.collision_margin;

        let on_floor = [Waypoint::new(0.0, floor, 0.0, true)];
        assert!(validate_trajectory(&on_floor, None, &config).is_safe);

        let below = [Waypoint::new(0.0, floor - 1e-6, 0.0, true)];
        let result = validate_trajectory(&below, None, &config);
        assert!(!result.is_safe);
        assert_eq!(result.violations[0].constraint, "table_collision");
        assert!(result.summary.starts_with("Trajectory UNSAFE: 1 violation(s). First: Waypoint 0"));
    }

    #[test]
    fn empty_trajectory_is_unsafe() {
        let result = validate_trajectory(&[], None, &SafetyConfig::default());
        assert!(!result.is_safe);
        assert_eq!(result.violations[0].constraint, "empty_trajectory");
        assert_eq!(result.first_violation_index(), None);
    }

    #[test]
    fn single_waypoint_passes_pairwise_checks() {
        let result = validate_trajectory(&[Waypoint::new(0.0, 1.0, 0.0, true)], None, &SafetyConfig::default());
        assert!(result.is_safe);
        assert_eq!(result.summary, "Trajectory valid: 1 waypoints passed all safety checks");
    }

    #[test]
    fn each_axis_reports_separately() {
        let result = validate_trajectory(&[Waypoint::new(2.0, 1.0, -2.0, true)], None, &SafetyConfig::default());
        let names: Vec<_> = result.violations.iter().map(|v| v.constraint).collect();
        assert_eq!(names, ["workspace_bounds_x", "workspace_bounds_z"]);
    }

    #[test]
    fn angular_rate_uses_combined_delta() {
        let config = SafetyConfig::default();
        // 70° on two axes: each within 90°/s, combined ~99°/s.
        let a = Waypoint::new(0.0, 1.0, 0.0, true);
        let b = a.with_orientation(70f64.to_radians(), 70f64.to_radians(), 0.0);
        let result = validate_trajectory(&[a, b], None, &config);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].constraint, "max_angular_velocity");
    }

    #[test]
    fn obstacle_clearance_only_warns_and_skips_held_object() {
        let config = SafetyConfig::default();
        let mut scene = SceneState::default()
            .with_object(SceneObject::new("cube", Shape::Box, "red", Vector3D::new(0.0, 0.6, 0.0), vec![0.1, 0.1, 0.1]))
            .unwrap();
        let wps = [Waypoint::new(0.0, 0.6, 0.0, true)];

        let result = validate_trajectory(&wps, Some(&scene), &config);
        assert!(result.is_safe);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.summary.starts_with("Trajectory valid with 1 warning(s): Waypoint 0: clearance"));

        scene.grasp("cube").unwrap();
        assert!(validate_trajectory(&wps, Some(&scene), &config).warnings.is_empty());
    }

    #[test]
    fn max_pair_velocity_reports_fastest_step() {
        let config = SafetyConfig::default();
        let wps = [
            Waypoint::new(0.0, 1.0, 0.0, true),
            Waypoint::new(0.5, 1.0, 0.0, true),
            Waypoint::new(0.5, 1.8, 0.0, true),
        ];
        assert!((max_pair_velocity(&wps, &config) - 0.8).abs() < 1e-9);
        assert_eq!(max_pair_velocity(&wps[..1], &config), 0.0);
    }

    #[test]
    fn non_finite_waypoint_is_unsafe() {
        let wps = [
            Waypoint::new(f64::NAN, f64::NAN, f64::NAN, true),
            Waypoint::new(0.0, 1.0, 0.0, true),
        ];
        let result = validate_trajectory(&wps, None, &SafetyConfig::default());
        assert!(!result.is_safe, "{}", result.summary);

        let names: Vec<_> = result.violations.iter().map(|v| v.constraint).collect();
        for expected in [
            "workspace_bounds_x",
            "workspace_bounds_y",
            "workspace_bounds_z",
            "table_collision",
            "max_linear_velocity",
            "max_waypoint_distance",
        ] {
            assert!(names.contains(&expected), "missing {expected} in {names:?}");
        }
        assert_eq!(result.first_violation_index(), Some(0));
    }

    #[test]
    fn infinite_orientation_fails_angular_check() {
        let a = Waypoint::new(0.0, 1.0, 0.0, true);
        let b = a.with_orientation(f64::INFINITY, 0.0, 0.0);
        let result = validate_trajectory(&[a, b], None, &SafetyConfig::default());
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].constraint, "max_angular_velocity");
    }

    fn arb_waypoint() -> impl Strategy<Value = Waypoint> {
        (-2.0..2.0f64, 0.0..3.5f64, -2.0..2.0f64, -3.0..3.0f64, any::<bool>())
            .prop_map(|(x, y, z, roll, open)| Waypoint::new(x, y, z, open).with_orientation(roll, 0.0, 0.0))
    }

    proptest! {
        #[test]
        fn validation_is_idempotent(wps in prop::collection::vec(arb_waypoint(), 0..12)) {
            let config = SafetyConfig::default();
            let first = validate_trajectory(&wps, None, &config);
            let second = validate_trajectory(&wps, None, &config);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn safe_means_no_errors(wps in prop::collection::vec(arb_waypoint(), 1..12)) {
            let result = validate_trajectory(&wps, None, &SafetyConfig::default());
            prop_assert_eq!(result.is_safe, result.violations.is_empty());
            prop_assert!(result.violations.iter().all(|v| v.severity == Severity::Error));
            prop_assert!(result.warnings.iter().all(|v| v.severity == Severity::Warning));
        }
    }
}
