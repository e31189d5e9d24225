//! Instance containers: one layer of setting overrides.
//!
//! Preset layers (quality, material, ...) are loaded once and shared between
//! stacks as `SharedContainer` (`Arc<InstanceContainer>`), which gives no
//! mutable access. The two per-stack layers that editing may touch are a
//! separate type, [`WritableContainer`], owned by exactly one stack.

use std::ops::Deref;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::EvalError;
use crate::expr::{parse, CompiledExpression};
use crate::value::Value;

/// Container kinds in priority order: earlier variants win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerType {
    User,
    QualityChanges,
    Intent,
    Quality,
    Material,
    Variant,
    DefinitionChanges,
}

impl ContainerType {
    /// Every layer, highest priority first. The definition sits below all of them.
    pub const PRIORITY: [ContainerType; 7] = [
        ContainerType::User,
        ContainerType::QualityChanges,
        ContainerType::Intent,
        ContainerType::Quality,
        ContainerType::Material,
        ContainerType::Variant,
        ContainerType::DefinitionChanges,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            ContainerType::User => "user",
            ContainerType::QualityChanges => "quality_changes",
            ContainerType::Intent => "intent",
            ContainerType::Quality => "quality",
            ContainerType::Material => "material",
            ContainerType::Variant => "variant",
            ContainerType::DefinitionChanges => "definition_changes",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::PRIORITY.into_iter().find(|t| t.tag() == tag)
    }

    /// User and definition_changes layers are per-stack and writable.
    pub fn is_writable(self) -> bool {
        matches!(self, ContainerType::User | ContainerType::DefinitionChanges)
    }
}

impl std::fmt::Display for ContainerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// The shared, read-only preset slots of a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresetLayer {
    QualityChanges,
    Intent,
    Quality,
    Material,
    Variant,
}

impl PresetLayer {
    pub const ALL: [PresetLayer; 5] = [
        PresetLayer::QualityChanges,
        PresetLayer::Intent,
        PresetLayer::Quality,
        PresetLayer::Material,
        PresetLayer::Variant,
    ];

    pub fn container_type(self) -> ContainerType {
        match self {
            PresetLayer::QualityChanges => ContainerType::QualityChanges,
            PresetLayer::Intent => ContainerType::Intent,
            PresetLayer::Quality => ContainerType::Quality,
            PresetLayer::Material => ContainerType::Material,
            PresetLayer::Variant => ContainerType::Variant,
        }
    }

    pub fn from_container_type(ty: ContainerType) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.container_type() == ty)
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// The two writable layer kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritableLayer {
    User,
    DefinitionChanges,
}

impl WritableLayer {
    pub fn container_type(self) -> ContainerType {
        match self {
            WritableLayer::User => ContainerType::User,
            WritableLayer::DefinitionChanges => ContainerType::DefinitionChanges,
        }
    }
}

/// A stored property: a literal, or a formula evaluated on read.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Literal(Value),
    Expression(CompiledExpression),
}

impl PropertyValue {
    /// Profile convention: a string starting with `=` is a formula.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, EvalError> {
        match json {
            serde_json::Value::String(s) if s.starts_with('=') => Ok(PropertyValue::Expression(parse(s)?)),
            other => Ok(PropertyValue::Literal(Value::from_json(other))),
        }
    }

    /// Definition convention for expression-valued fields: every string is a
    /// formula, numbers and booleans are literals.
    pub fn from_definition_json(json: &serde_json::Value) -> Result<Self, EvalError> {
        match json {
            serde_json::Value::String(s) => Ok(PropertyValue::Expression(parse(s)?)),
            other => Ok(PropertyValue::Literal(Value::from_json(other))),
        }
    }

    pub fn formula(source: &str) -> Result<Self, EvalError> {
        Ok(PropertyValue::Expression(parse(source)?))
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            PropertyValue::Literal(v) => v.to_json(),
            PropertyValue::Expression(e) => serde_json::Value::String(format!("={}", e.source())),
        }
    }

    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            PropertyValue::Literal(v) => Some(v),
            PropertyValue::Expression(_) => None,
        }
    }

    pub fn as_expression(&self) -> Option<&CompiledExpression> {
        match self {
            PropertyValue::Expression(e) => Some(e),
            PropertyValue::Literal(_) => None,
        }
    }
}

impl From<Value> for PropertyValue {
    fn from(v: Value) -> Self {
        PropertyValue::Literal(v)
    }
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyValue::Literal(v) => write!(f, "{}", v),
            PropertyValue::Expression(e) => write!(f, "={}", e),
        }
    }
}

/// Plain record shape used by profile loaders.
///
/// `values` maps a key either to a bare JSON value (its `value` property) or
/// to an object of property name -> value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub container_type: ContainerType,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub values: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct InstanceContainer {
    id: String,
    container_type: ContainerType,
    metadata: serde_json::Map<String, serde_json::Value>,
    properties: FxHashMap<String, FxHashMap<String, PropertyValue>>,
}

pub type SharedContainer = Arc<InstanceContainer>;

impl InstanceContainer {
    pub fn new(id: impl Into<String>, container_type: ContainerType) -> Self {
        Self {
            id: id.into(),
            container_type,
            metadata: serde_json::Map::new(),
            properties: FxHashMap::default(),
        }
    }

    pub fn from_record(record: &ContainerRecord) -> Result<Self, EvalError> {
        let mut container = Self::new(record.id.clone(), record.container_type);
        container.metadata = record.metadata.clone();
        for (key, entry) in &record.values {
            match entry {
                serde_json::Value::Object(props) => {
                    for (property, raw) in props {
                        container.set_property(key, property, PropertyValue::from_json(raw)?);
                    }
                }
                raw => {
                    container.set_property(key, "value", PropertyValue::from_json(raw)?);
                }
            }
        }
        Ok(container)
    }

    /// Inverse of `from_record`. Keys are emitted in sorted order.
    pub fn to_record(&self) -> ContainerRecord {
        let mut values = serde_json::Map::new();
        for key in self.keys() {
            let Some(props) = self.properties.get(key) else { continue };
            let entry = match (props.len(), props.get("value")) {
                (1, Some(value)) => value.to_json(),
                _ => {
                    let mut names: Vec<&String> = props.keys().collect();
                    names.sort();
                    let mut obj = serde_json::Map::new();
                    for name in names {
                        obj.insert(name.clone(), props[name].to_json());
                    }
                    serde_json::Value::Object(obj)
                }
            };
            values.insert(key.to_string(), entry);
        }
        ContainerRecord {
            id: self.id.clone(),
            container_type: self.container_type,
            metadata: self.metadata.clone(),
            values,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn container_type(&self) -> ContainerType {
        self.container_type
    }

    pub fn metadata(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.metadata
    }

    pub fn metadata_entry(&self, entry: &str) -> Option<&serde_json::Value> {
        self.metadata.get(entry)
    }

    pub fn set_metadata(&mut self, entry: &str, value: serde_json::Value) {
        self.metadata.insert(entry.to_string(), value);
    }

    pub fn property(&self, key: &str, property: &str) -> Option<&PropertyValue> {
        self.properties.get(key).and_then(|props| props.get(property))
    }

    pub fn has_property(&self, key: &str, property: &str) -> bool {
        self.property(key, property).is_some()
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    /// Keys with at least one property, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.properties.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Store a property, returning the one it replaced.
    pub fn set_property(&mut self, key: &str, property: &str, value: PropertyValue) -> Option<PropertyValue> {
        self.properties
            .entry(key.to_string())
            .or_default()
            .insert(property.to_string(), value)
    }

    pub fn remove_property(&mut self, key: &str, property: &str) -> Option<PropertyValue> {
        let props = self.properties.get_mut(key)?;
        let removed = props.remove(property);
        if props.is_empty() {
            self.properties.remove(key);
        }
        removed
    }

    /// Drop every property. Returns the keys that were present.
    pub fn clear(&mut self) -> Vec<String> {
        let mut keys: Vec<String> = self.properties.drain().map(|(k, _)| k).collect();
        keys.sort_unstable();
        keys
    }

    pub fn into_shared(self) -> SharedContainer {
        Arc::new(self)
    }
}

/// A per-stack layer that normal editing writes to. Never shared.
#[derive(Debug, Clone)]
pub struct WritableContainer {
    inner: InstanceContainer,
}

impl WritableContainer {
    pub fn new(id: impl Into<String>, layer: WritableLayer) -> Self {
        Self {
            inner: InstanceContainer::new(id, layer.container_type()),
        }
    }

    /// Adopt a loaded container as a writable layer. Fails unless its type
    /// is `user` or `definition_changes`.
    pub fn from_container(container: InstanceContainer) -> Result<Self, InstanceContainer> {
        if container.container_type().is_writable() {
            Ok(Self { inner: container })
        } else {
            Err(container)
        }
    }

    pub(crate) fn set_property(&mut self, key: &str, property: &str, value: PropertyValue) -> Option<PropertyValue> {
        self.inner.set_property(key, property, value)
    }

    pub(crate) fn remove_property(&mut self, key: &str, property: &str) -> Option<PropertyValue> {
        self.inner.remove_property(key, property)
    }

    pub(crate) fn clear(&mut self) -> Vec<String> {
        self.inner.clear()
    }

    pub fn into_inner(self) -> InstanceContainer {
        self.inner
    }
}

impl Deref for WritableContainer {
    type Target = InstanceContainer;

    fn deref(&self) -> &InstanceContainer {
        &self.inner
    }
}
