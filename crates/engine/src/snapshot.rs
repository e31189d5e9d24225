//! Bulk resolution of one stack, as handed to the slicing process.
//!
//! Every non-category key is resolved once. Keys whose `enabled` is false are
//! left out unless `snapshot.include_disabled` is set. A key whose value fails
//! to resolve is never emitted as a value; its error is reported instead.

use std::collections::BTreeMap;

use crate::engine::SettingsEngine;
use crate::error::{EvalError, StackError};
use crate::setting_id::StackId;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub stack: StackId,
    /// Revision of the engine the snapshot was taken at.
    pub revision: u64,
    pub values: BTreeMap<String, Value>,
    pub errors: BTreeMap<String, EvalError>,
    /// Keys left out because they are disabled.
    pub disabled: Vec<String>,
}

impl Snapshot {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// `{key: value}` in key order.
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> =
            self.values.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
        serde_json::Value::Object(map)
    }
}

impl SettingsEngine {
    pub fn snapshot(&self, stack: StackId) -> Result<Snapshot, StackError> {
        let definition = self.graph.get(stack)?.definition().clone();
        let include_disabled = self.config.snapshot.include_disabled;

        let mut snapshot = Snapshot {
            stack,
            revision: self.revision(),
            values: BTreeMap::new(),
            errors: BTreeMap::new(),
            disabled: Vec::new(),
        };

        for setting in definition.iter().filter(|d| !d.is_category()) {
            let key = setting.key.as_str();
            if !include_disabled && !self.is_enabled(stack, key) {
                snapshot.disabled.push(key.to_string());
                continue;
            }
            match self.try_get_property(stack, key, "value") {
                Ok(Some(value)) if !value.is_undefined() => {
                    snapshot.values.insert(key.to_string(), value);
                }
                Ok(_) => {
                    let stack_name = self.graph.get(stack)?.name().to_string();
                    snapshot.errors.insert(
                        key.to_string(),
                        EvalError::UnresolvedReference {
                            key: key.to_string(),
                            stack: stack_name,
                        },
                    );
                }
                Err(StackError::Expression(e)) => {
                    snapshot.errors.insert(key.to_string(), e);
                }
                Err(e) => return Err(e),
            }
        }

        tracing::debug!(
            stack = %stack,
            values = snapshot.values.len(),
            errors = snapshot.errors.len(),
            disabled = snapshot.disabled.len(),
            "snapshot taken"
        );
        Ok(snapshot)
    }

    /// A key whose `enabled` formula fails counts as enabled, so its value
    /// (or its error) still reaches the snapshot.
    fn is_enabled(&self, stack: StackId, key: &str) -> bool {
        match self.try_get_property(stack, key, "enabled") {
            Ok(Some(Value::Bool(enabled))) => enabled,
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(stack = %stack, key, error = %e, "enabled failed; treating as enabled");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, SnapshotConfig};
    use crate::container::WritableLayer;
    use crate::harness::Fixture;

    #[test]
    fn test_snapshot_has_every_enabled_key() {
        let fx = Fixture::new();
        let snap = fx.engine.snapshot(fx.global).unwrap();
        assert!(snap.is_complete());
        assert_eq!(snap.get("layer_height"), Some(&Value::Float(0.1)));
        assert_eq!(snap.get("wall_line_count"), Some(&Value::Int(2)));
        assert_eq!(snap.get("material_bed_temperature"), Some(&Value::Float(60.0)));
        // categories are never emitted
        assert!(snap.get("resolution").is_none());
        // support is off, so support_speed is disabled
        assert!(snap.get("support_speed").is_none());
        assert_eq!(snap.disabled, vec!["support_speed"]);
    }

    #[test]
    fn test_include_disabled() {
        let fx = Fixture::with_config(EngineConfig {
            snapshot: SnapshotConfig { include_disabled: true },
            ..Default::default()
        });
        let snap = fx.engine.snapshot(fx.global).unwrap();
        assert_eq!(snap.get("support_speed"), Some(&Value::Float(60.0)));
        assert!(snap.disabled.is_empty());
    }

    #[test]
    fn test_failed_keys_reported_not_emitted() {
        let mut fx = Fixture::new();
        let g = fx.global;
        fx.engine.set_formula(g, WritableLayer::User, "speed_print", "value", "nope * 2").unwrap();
        let snap = fx.engine.snapshot(g).unwrap();
        assert!(!snap.is_complete());
        assert!(snap.get("speed_print").is_none());
        assert!(snap.get("speed_travel").is_none());
        assert!(matches!(
            snap.errors.get("speed_print"),
            Some(EvalError::UnresolvedReference { key, .. }) if key == "nope"
        ));
        assert!(snap.errors.contains_key("speed_travel"));
        assert_eq!(snap.get("layer_height"), Some(&Value::Float(0.1)));
    }

    #[test]
    fn test_extruder_snapshot_and_json() {
        let mut fx = Fixture::new();
        let e1 = fx.extruders[1];
        fx.engine.set_value(e1, "machine_nozzle_size", 0.6).unwrap();
        let snap = fx.engine.snapshot(e1).unwrap();
        assert_eq!(snap.get("line_width"), Some(&Value::Float(0.6)));
        assert_eq!(snap.get("layer_height"), Some(&Value::Float(0.1)));

        let json = snap.to_json();
        assert_eq!(json["line_width"], serde_json::json!(0.6));
        assert_eq!(json["adhesion_type"], serde_json::json!("brim"));
    }

    #[test]
    fn test_unknown_stack() {
        let fx = Fixture::new();
        assert!(matches!(
            fx.engine.snapshot(StackId(42)),
            Err(StackError::UnknownStack(_))
        ));
    }
}
