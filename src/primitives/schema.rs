//! Versioned primitive contract.
//!
//! The schema document is what callers and decomposition providers code against: for every
//! primitive it lists parameters (types, ranges, enums, defaults), pre- and postconditions and
//! the safety fields the validator enforces. Versioning is semantic:
//!
//! - patch: wording or limit tweaks
//! - minor: new backward-compatible parameters
//! - major: primitives added or removed

use serde::Serialize;
use serde_json::Value;

use crate::error::PlanError;
use crate::primitives::{ActionId, Params};

pub const SCHEMA_VERSION: &str = "1.0.0";

/// Serializable contract for the whole registry.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaDocument {
    pub version: &'static str,
    pub primitives: Vec<PrimitiveSchema>,
}

impl SchemaDocument {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn primitive(&self, id: ActionId) -> Option<&PrimitiveSchema> {
        self.primitives.iter().find(|p| p.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamKind {
    /// Id of an object in the scene.
    ObjectId,
    ObjectIdList,
    Number { min: f64, max: f64, unit: &'static str },
    Vec3,
    Bool,
    Enum { values: &'static [&'static str] },
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamSpec {
    pub name: &'static str,
    #[serde(flatten)]
    pub kind: ParamKind,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    pub description: &'static str,
}

impl ParamSpec {
    pub fn required(name: &'static str, kind: ParamKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: true,
            default: None,
            description,
        }
    }

    pub fn optional(name: &'static str, kind: ParamKind, default: Option<Value>, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: false,
            default,
            description,
        }
    }

    fn check(&self, value: &Value) -> Result<(), PlanError> {
        let mismatch = |expected: &str| PlanError::parameter(self.name, format!("expected {expected}, got {value}"));
        match &self.kind {
            ParamKind::ObjectId | ParamKind::Text => {
                value.as_str().map(|_| ()).ok_or_else(|| mismatch("a string"))
            }
            ParamKind::ObjectIdList => {
                let items = value.as_array().ok_or_else(|| mismatch("a list of object ids"))?;
                if items.is_empty() {
                    return Err(PlanError::parameter(self.name, "must name at least one object"));
                }
                if items.iter().all(Value::is_string) {
                    Ok(())
                } else {
                    Err(mismatch("a list of object ids"))
                }
            }
            ParamKind::Number { min, max, unit } => {
                let n = value.as_f64().ok_or_else(|| mismatch("a number"))?;
                if n < *min || n > *max {
                    return Err(PlanError::parameter(
                        self.name,
                        format!("{n} outside [{min}, {max}] {unit}"),
                    ));
                }
                Ok(())
            }
            ParamKind::Vec3 => match value.as_array() {
                Some(items) if items.len() == 3 && items.iter().all(|v| v.as_f64().is_some_and(f64::is_finite)) => Ok(()),
                _ => Err(mismatch("[x, y, z]")),
            },
            ParamKind::Bool => value.as_bool().map(|_| ()).ok_or_else(|| mismatch("a boolean")),
            ParamKind::Enum { values } => {
                let s = value.as_str().ok_or_else(|| mismatch("a string"))?;
                if values.iter().any(|v| *v == s) {
                    Ok(())
                } else {
                    Err(PlanError::parameter(self.name, format!("'{s}' is not one of {values:?}")))
                }
            }
        }
    }
}

/// Safety limits a primitive declares for itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyFields {
    pub collision_check: bool,
    /// m/s
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_velocity: Option<f64>,
    /// N
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_force: Option<f64>,
    pub stability_check: bool,
    pub timeout_ms: u64,
}

impl Default for SafetyFields {
    fn default() -> Self {
        Self {
            collision_check: true,
            max_velocity: Some(1.0),
            max_force: None,
            stability_check: false,
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrimitiveSchema {
    pub id: ActionId,
    pub description: &'static str,
    pub params: Vec<ParamSpec>,
    pub preconditions: Vec<&'static str>,
    pub postconditions: Vec<&'static str>,
    pub safety: SafetyFields,
}

impl PrimitiveSchema {
    /// Checks `params` against this contract: required names present, types, ranges and enum
    /// members respected. Names outside the contract are logged and otherwise ignored.
    pub fn check(&self, params: &Params) -> Result<(), PlanError> {
        for unknown in params
            .keys()
            .filter(|k| !self.params.iter().any(|spec| spec.name == k.as_str()))
        {
            tracing::warn!("Ignoring unknown parameter '{unknown}' for {}", self.id);
        }

        for spec in &self.params {
            match params.get(spec.name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(PlanError::parameter(spec.name, "is required"));
                }
                None | Some(Value::Null) => {}
                Some(value) => spec.check(value)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::test_support::params;
    use crate::primitives::PrimitiveRegistry;
    use serde_json::json;

    #[test]
    fn document_lists_every_primitive_under_current_version() {
        let doc = PrimitiveRegistry::new().schema_document();
        assert_eq!(doc.version, SCHEMA_VERSION);
        assert_eq!(doc.primitives.len(), 12);

        let raw = doc.to_json().expect("schema serializes");
        let parsed: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["primitives"][0]["id"], "APPROACH");
        assert!(parsed["primitives"][0]["safety"]["collision_check"].is_boolean());
    }

    #[test]
    fn rotate_schema_enforces_axis_enum_and_range() {
        let doc = PrimitiveRegistry::new().schema_document();
        let rotate = doc.primitive(ActionId::Rotate).unwrap();

        assert!(rotate.check(&params(json!({"axis": "x", "degrees": 45}))).is_ok());
        assert!(rotate.check(&params(json!({"axis": "w", "degrees": 45}))).is_err());
        assert!(rotate.check(&params(json!({"axis": "x", "degrees": 720}))).is_err());
        assert!(rotate.check(&params(json!({"axis": "x"}))).is_err());
    }

    #[test]
    fn unknown_parameter_names_are_ignored() {
        let doc = PrimitiveRegistry::new().schema_document();
        let grasp = doc.primitive(ActionId::Grasp).unwrap();
        assert!(grasp.check(&params(json!({"target": "a", "speed": 3}))).is_ok());
        // Known names are still type-checked alongside extras.
        assert!(grasp.check(&params(json!({"target": 7, "speed": 3}))).is_err());
    }

    #[test]
    fn sort_requires_non_empty_object_list() {
        let doc = PrimitiveRegistry::new().schema_document();
        let sort = doc.primitive(ActionId::Sort).unwrap();
        assert!(sort.check(&params(json!({"objects": []}))).is_err());
        assert!(sort.check(&params(json!({"objects": ["a"], "direction": "front_to_back"}))).is_ok());
    }
}
