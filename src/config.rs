//! Runtime configuration.
//!
//! Everything here is established once at startup and then shared read-only by every
//! session. Each section defaults independently, so a config file only has to name the
//! limits it changes:
//!
//! ```json
//! { "safety": { "max_linear_velocity": 2.5, "assumed_dt": 2.0 },
//!   "confirmation": { "timeout_ms": 10000 } }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Axis-aligned bounding box of reachable space (meters, inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceBounds {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
    pub z_min: f64,
    pub z_max: f64,
}

impl Default for WorkspaceBounds {
    fn default() -> Self {
        Self {
            x_min: -1.5,
            x_max: 1.5,
            y_min: 0.0,
            y_max: 3.0,
            z_min: -1.5,
            z_max: 1.5,
        }
    }
}

/// Hard and soft limits checked by the safety validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub workspace: WorkspaceBounds,
    pub table_height: f64,
    pub collision_margin: f64,
    /// m/s
    pub max_linear_velocity: f64,
    /// rad/s
    pub max_angular_velocity: f64,
    /// N
    pub max_gripper_force: f64,
    pub min_obstacle_clearance: f64,
    pub max_waypoint_distance: f64,
    /// Assumed seconds between consecutive waypoints.
    pub assumed_dt: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            workspace: WorkspaceBounds::default(),
            table_height: 0.5,
            collision_margin: 0.01,
            max_linear_velocity: 1.0,
            max_angular_velocity: std::f64::consts::FRAC_PI_2,
            max_gripper_force: 20.0,
            min_obstacle_clearance: 0.02,
            max_waypoint_distance: 2.0,
            assumed_dt: 1.0,
        }
    }
}

impl SafetyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ws = &self.workspace;
        if ws.x_min > ws.x_max || ws.y_min > ws.y_max || ws.z_min > ws.z_max {
            return Err(ConfigError::Invalid(
                "workspace bounds have min greater than max".to_string(),
            ));
        }
        let positive = [
            ("assumed_dt", self.assumed_dt),
            ("max_linear_velocity", self.max_linear_velocity),
            ("max_angular_velocity", self.max_angular_velocity),
            ("max_waypoint_distance", self.max_waypoint_distance),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Invalid(format!("{name} must be positive, got {value}")));
            }
        }
        if self.collision_margin < 0.0 || self.min_obstacle_clearance < 0.0 {
            return Err(ConfigError::Invalid("margins must not be negative".to_string()));
        }
        Ok(())
    }
}

/// When a validated trajectory needs a human to approve it, and how long to wait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationPolicy {
    /// Trajectories with more waypoints than this require confirmation.
    pub waypoint_threshold: usize,
    /// Any adjacent-pair velocity above this fraction of the limit requires confirmation.
    pub velocity_fraction: f64,
    /// Default confirmation wait; callers may override per session.
    pub timeout_ms: u64,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            waypoint_threshold: 5,
            velocity_fraction: 0.8,
            timeout_ms: 30_000,
        }
    }
}

impl ConfirmationPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub safety: SafetyConfig,
    pub confirmation: ConfirmationPolicy,
    /// Plan journal location; `None` disables journaling.
    pub journal_path: Option<PathBuf>,
}

impl RuntimeConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.safety.validate()?;
        let fraction = self.confirmation.velocity_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "velocity_fraction must be in (0, 1], got {fraction}"
            )));
        }
        Ok(())
    }
}
