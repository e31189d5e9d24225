//! Setting definitions: the static, per-machine-family description of every
//! setting (type, default formula, bounds, applicability, tree position).
//!
//! A [`DefinitionTree`] is built once per family by the [`DefinitionStore`]
//! and is immutable afterwards; stacks hold it behind an `Arc`.

mod raw;
mod store;

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::container::PropertyValue;
use crate::error::DefinitionError;
use crate::expr::CompiledExpression;
use crate::value::{IntCoercion, SettingType, Value};

pub use raw::{JsonMap, RawDefinition};
pub use store::DefinitionStore;

/// Property names with dedicated fields on a definition. Everything else a
/// definition carries is a custom property.
pub const BUILTIN_PROPERTIES: &[&str] = &[
    "type",
    "label",
    "description",
    "unit",
    "default_value",
    "value",
    "minimum_value",
    "maximum_value",
    "minimum_value_warning",
    "maximum_value_warning",
    "enabled",
    "resolve",
    "limit_to_extruder",
    "settable_per_mesh",
    "settable_per_extruder",
    "settable_per_meshgroup",
    "settable_globally",
    "options",
    "int_rounding",
];

/// One of the four numeric bounds checked by validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bound {
    Minimum,
    Maximum,
    MinimumWarning,
    MaximumWarning,
}

impl Bound {
    pub const ALL: [Bound; 4] = [Bound::Minimum, Bound::Maximum, Bound::MinimumWarning, Bound::MaximumWarning];

    pub fn property(self) -> &'static str {
        match self {
            Bound::Minimum => "minimum_value",
            Bound::Maximum => "maximum_value",
            Bound::MinimumWarning => "minimum_value_warning",
            Bound::MaximumWarning => "maximum_value_warning",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettingDefinition {
    pub key: String,
    pub setting_type: SettingType,
    pub label: String,
    pub description: String,
    pub unit: String,
    /// Literal fallback value.
    pub default_value: Value,
    /// Formula for the value; takes precedence over `default_value`.
    pub value: Option<PropertyValue>,
    pub minimum_value: Option<PropertyValue>,
    pub maximum_value: Option<PropertyValue>,
    pub minimum_value_warning: Option<PropertyValue>,
    pub maximum_value_warning: Option<PropertyValue>,
    pub enabled: Option<PropertyValue>,
    /// Global aggregation over extruders.
    pub resolve: Option<CompiledExpression>,
    /// Formula yielding the extruder position whose stack owns this key.
    pub limit_to_extruder: Option<PropertyValue>,
    pub settable_per_mesh: bool,
    pub settable_per_extruder: bool,
    pub settable_per_meshgroup: bool,
    pub settable_globally: bool,
    /// Enum options, in declared order: (option key, label).
    pub options: Vec<(String, String)>,
    pub int_rounding: Option<IntCoercion>,
    pub custom: BTreeMap<String, Value>,
    pub parent: Option<String>,
    pub children: Vec<String>,
    /// 0 for top-level nodes.
    pub depth: usize,
}

impl SettingDefinition {
    pub(crate) fn from_fields(
        family: &str,
        key: &str,
        fields: &JsonMap,
        parent: Option<String>,
        children: Vec<String>,
        depth: usize,
    ) -> Result<Self, DefinitionError> {
        let malformed = |reason: String| DefinitionError::malformed(family, reason);

        let setting_type = match fields.get("type") {
            Some(serde_json::Value::String(tag)) => SettingType::from_tag(tag)
                .ok_or_else(|| malformed(format!("unknown type tag '{}' for '{}'", tag, key)))?,
            Some(other) => return Err(malformed(format!("type of '{}' must be a string, got {}", key, other))),
            None => return Err(malformed(format!("setting '{}' has no type", key))),
        };

        let text = |name: &str| -> String {
            match fields.get(name) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            }
        };

        let formula = |name: &str| -> Result<Option<PropertyValue>, DefinitionError> {
            fields
                .get(name)
                .map(PropertyValue::from_definition_json)
                .transpose()
                .map_err(|e| malformed(format!("{} of '{}': {}", name, key, e)))
        };

        let flag = |name: &str| -> Result<bool, DefinitionError> {
            match fields.get(name) {
                None => Ok(true),
                Some(serde_json::Value::Bool(b)) => Ok(*b),
                Some(other) => Err(malformed(format!("{} of '{}' must be a boolean, got {}", name, key, other))),
            }
        };

        let resolve = match formula("resolve")? {
            None => None,
            Some(PropertyValue::Expression(e)) => Some(e),
            Some(PropertyValue::Literal(v)) => {
                return Err(malformed(format!("resolve of '{}' must be a formula, got {}", key, v)))
            }
        };

        let options = match fields.get("options") {
            None => Vec::new(),
            Some(serde_json::Value::Object(opts)) => opts
                .iter()
                .map(|(k, label)| (k.clone(), label.as_str().map(String::from).unwrap_or_else(|| label.to_string())))
                .collect(),
            Some(other) => return Err(malformed(format!("options of '{}' must be an object, got {}", key, other))),
        };

        let int_rounding = match fields.get("int_rounding") {
            None => None,
            Some(serde_json::Value::String(tag)) => Some(
                IntCoercion::from_tag(tag)
                    .ok_or_else(|| malformed(format!("unknown int_rounding '{}' for '{}'", tag, key)))?,
            ),
            Some(other) => return Err(malformed(format!("int_rounding of '{}' must be a string, got {}", key, other))),
        };

        let custom = fields
            .iter()
            .filter(|(name, _)| !BUILTIN_PROPERTIES.contains(&name.as_str()))
            .map(|(name, v)| (name.clone(), Value::from_json(v)))
            .collect();

        Ok(Self {
            key: key.to_string(),
            setting_type,
            label: text("label"),
            description: text("description"),
            unit: text("unit"),
            default_value: fields.get("default_value").map(Value::from_json).unwrap_or_default(),
            value: formula("value")?,
            minimum_value: formula("minimum_value")?,
            maximum_value: formula("maximum_value")?,
            minimum_value_warning: formula("minimum_value_warning")?,
            maximum_value_warning: formula("maximum_value_warning")?,
            enabled: formula("enabled")?,
            resolve,
            limit_to_extruder: formula("limit_to_extruder")?,
            settable_per_mesh: flag("settable_per_mesh")?,
            settable_per_extruder: flag("settable_per_extruder")?,
            settable_per_meshgroup: flag("settable_per_meshgroup")?,
            settable_globally: flag("settable_globally")?,
            options,
            int_rounding,
            custom,
            parent,
            children,
            depth,
        })
    }

    pub fn is_category(&self) -> bool {
        self.setting_type == SettingType::Category
    }

    pub fn bound(&self, bound: Bound) -> Option<&PropertyValue> {
        match bound {
            Bound::Minimum => self.minimum_value.as_ref(),
            Bound::Maximum => self.maximum_value.as_ref(),
            Bound::MinimumWarning => self.minimum_value_warning.as_ref(),
            Bound::MaximumWarning => self.maximum_value_warning.as_ref(),
        }
    }

    pub fn has_option(&self, option: &str) -> bool {
        self.options.iter().any(|(k, _)| k == option)
    }

    /// The definition-level value of a property, as the bottom layer of every
    /// stack sees it. `None` when the definition does not provide it.
    pub fn property(&self, name: &str) -> Option<PropertyValue> {
        let literal = |v: Value| Some(PropertyValue::Literal(v));
        match name {
            "value" => {
                if self.is_category() {
                    return None;
                }
                match &self.value {
                    Some(formula) => Some(formula.clone()),
                    None if self.default_value.is_undefined() => None,
                    None => literal(self.default_value.clone()),
                }
            }
            "default_value" => (!self.default_value.is_undefined()).then(|| PropertyValue::Literal(self.default_value.clone())),
            "minimum_value" | "maximum_value" | "minimum_value_warning" | "maximum_value_warning" => {
                let bound = Bound::ALL.into_iter().find(|b| b.property() == name)?;
                self.bound(bound).cloned()
            }
            "enabled" => Some(self.enabled.clone().unwrap_or(PropertyValue::Literal(Value::Bool(true)))),
            "resolve" => self.resolve.clone().map(PropertyValue::Expression),
            "limit_to_extruder" => self.limit_to_extruder.clone(),
            "type" => literal(Value::String(self.setting_type.tag().to_string())),
            "label" => literal(Value::String(self.label.clone())),
            "description" => literal(Value::String(self.description.clone())),
            "unit" => literal(Value::String(self.unit.clone())),
            "settable_per_mesh" => literal(Value::Bool(self.settable_per_mesh)),
            "settable_per_extruder" => literal(Value::Bool(self.settable_per_extruder)),
            "settable_per_meshgroup" => literal(Value::Bool(self.settable_per_meshgroup)),
            "settable_globally" => literal(Value::Bool(self.settable_globally)),
            "options" if !self.options.is_empty() => literal(Value::List(
                self.options.iter().map(|(k, _)| Value::String(k.clone())).collect(),
            )),
            "int_rounding" => self
                .int_rounding
                .map(|r| PropertyValue::Literal(Value::String(r.tag().to_string()))),
            other => self.custom.get(other).cloned().map(PropertyValue::Literal),
        }
    }
}

/// The flattened, merged setting tree of one machine family.
#[derive(Debug, Clone)]
pub struct DefinitionTree {
    family: String,
    name: String,
    metadata: JsonMap,
    /// Inherits chain, root ancestor first, this family last.
    chain: Vec<String>,
    roots: Vec<String>,
    /// Depth-first declaration order.
    order: Vec<String>,
    settings: FxHashMap<String, SettingDefinition>,
}

impl DefinitionTree {
    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metadata(&self) -> &JsonMap {
        &self.metadata
    }

    pub fn inherits_chain(&self) -> &[String] {
        &self.chain
    }

    pub fn get(&self, key: &str) -> Option<&SettingDefinition> {
        self.settings.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.settings.contains_key(key)
    }

    /// Every key, depth-first in declaration order.
    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.order.iter().map(String::as_str)
    }

    /// Every definition, depth-first in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &SettingDefinition> + '_ {
        self.order.iter().filter_map(|k| self.settings.get(k))
    }

    pub fn roots(&self) -> &[String] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.settings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.settings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: serde_json::Value) -> JsonMap {
        v.as_object().cloned().unwrap()
    }

    fn build(v: serde_json::Value) -> Result<SettingDefinition, DefinitionError> {
        SettingDefinition::from_fields("test", "k", &fields(v), None, Vec::new(), 0)
    }

    #[test]
    fn test_defaults_for_omitted_fields() {
        let def = build(json!({"type": "float", "default_value": 0.2})).unwrap();
        assert!(def.settable_per_mesh);
        assert!(def.settable_per_extruder);
        assert!(def.settable_globally);
        assert_eq!(def.property("enabled"), Some(PropertyValue::Literal(Value::Bool(true))));
        assert_eq!(def.property("value"), Some(PropertyValue::Literal(Value::Float(0.2))));
        assert!(def.property("minimum_value").is_none());
    }

    #[test]
    fn test_value_formula_wins_over_default() {
        let def = build(json!({"type": "float", "default_value": 1, "value": "layer_height * 2"})).unwrap();
        let value = def.property("value").unwrap();
        assert_eq!(value.as_expression().map(|e| e.source()), Some("layer_height * 2"));
        assert_eq!(def.property("default_value"), Some(PropertyValue::Literal(Value::Int(1))));
    }

    #[test]
    fn test_bounds_strings_are_formulas() {
        let def = build(json!({"type": "float", "minimum_value": "0.001", "maximum_value": 10})).unwrap();
        assert!(def.bound(Bound::Minimum).unwrap().as_expression().is_some());
        assert_eq!(def.bound(Bound::Maximum), Some(&PropertyValue::Literal(Value::Int(10))));
    }

    #[test]
    fn test_unknown_type_tag_is_malformed() {
        let err = build(json!({"type": "colour"})).unwrap_err();
        assert!(err.to_string().contains("unknown type tag 'colour'"));
        assert!(build(json!({"label": "no type"})).is_err());
    }

    #[test]
    fn test_formula_syntax_error_is_malformed() {
        let err = build(json!({"type": "int", "value": "1 +"})).unwrap_err();
        assert!(matches!(err, DefinitionError::MalformedDefinition { .. }));
    }

    #[test]
    fn test_options_and_custom_properties() {
        let def = build(json!({
            "type": "enum",
            "options": {"skirt": "Skirt", "brim": "Brim", "none": "None"},
            "default_value": "brim",
            "comments": "shown in tooltips"
        }))
        .unwrap();
        assert_eq!(
            def.property("options"),
            Some(PropertyValue::Literal(Value::List(vec![
                Value::String("skirt".into()),
                Value::String("brim".into()),
                Value::String("none".into()),
            ])))
        );
        assert!(def.has_option("none"));
        assert_eq!(
            def.property("comments"),
            Some(PropertyValue::Literal(Value::String("shown in tooltips".into())))
        );
    }

    #[test]
    fn test_category_has_no_value() {
        let def = build(json!({"type": "category", "label": "Shell"})).unwrap();
        assert!(def.is_category());
        assert!(def.property("value").is_none());
        assert_eq!(def.property("label"), Some(PropertyValue::Literal(Value::String("Shell".into()))));
    }

    #[test]
    fn test_settable_flag_must_be_bool() {
        assert!(build(json!({"type": "int", "settable_per_extruder": "yes"})).is_err());
        let def = build(json!({"type": "int", "settable_per_extruder": false})).unwrap();
        assert!(!def.settable_per_extruder);
    }

    #[test]
    fn test_resolve_must_be_formula() {
        assert!(build(json!({"type": "bool", "resolve": true})).is_err());
        let def = build(json!({"type": "bool", "resolve": "any(extruderValues('k'))"})).unwrap();
        assert!(def.resolve.is_some());
    }
}
