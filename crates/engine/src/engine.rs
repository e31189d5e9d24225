//! The settings engine: definition store, stack graph, formula registry and
//! the resolution state they feed.
//!
//! # Reads and writes
//!
//! Reads take `&self` and may run from many threads at once; each builds its
//! own [`Resolver`]. Writes take `&mut self`, so the borrow checker gives
//! them exclusive access: a write stores, invalidates, bumps the revision
//! and only then notifies observers.
//!
//! # Invalidation
//!
//! - Writing `(S, K)` evicts the stale closure of `(S, K)` in the
//!   dependency graph.
//! - Composition changes (preset swap, extruder added or toggled, object
//!   added, rebound or removed) evict everything cached for the whole
//!   machine. Material metadata and extruder enablement are read without
//!   recording edges, so nothing narrower is safe.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::cache::{Resolved, ResolutionState};
use crate::config::EngineConfig;
use crate::container::{PresetLayer, PropertyValue, SharedContainer, WritableContainer, WritableLayer};
use crate::definition::{Bound, DefinitionStore, RawDefinition, SettingDefinition};
use crate::error::{DefinitionError, StackError};
use crate::events::{ChangeEvent, EventCallback, PropertyChangedEvent, RewireReason, StackRewiredEvent};
use crate::expr::{Arity, FunctionImpl, FunctionRegistry};
use crate::resolver::{Redirect, Resolver};
use crate::setting_id::{PropertyId, SettingRef, StackId};
use crate::stack::{ContainerStack, LayerSource, RouteTarget, StackGraph, StackKind};
use crate::validation::{ValidationState, VALIDATION_STATE};
use crate::value::Value;

/// How `explain` found the raw `value` of a key.
#[derive(Debug, Clone, PartialEq)]
pub struct Explanation {
    pub stack: StackId,
    pub key: String,
    /// The read was answered by another stack (or by `resolve`).
    pub redirect: Option<Redirect>,
    /// Layer holding the raw value on this stack's walk, if any.
    pub source: Option<LayerSource>,
    pub raw: Option<PropertyValue>,
    /// Settings the raw formula names, from static analysis.
    pub references: Vec<String>,
    pub value: Resolved,
}

pub struct SettingsEngine {
    definitions: DefinitionStore,
    pub(crate) graph: StackGraph,
    pub(crate) functions: FunctionRegistry,
    pub(crate) config: EngineConfig,
    pub(crate) state: RwLock<ResolutionState>,
    pub(crate) evaluations: AtomicU64,
    revision: u64,
    observers: Mutex<Vec<EventCallback>>,
}

impl Default for SettingsEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl std::fmt::Debug for SettingsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsEngine")
            .field("families", &self.definitions.families())
            .field("stacks", &self.graph.ids().count())
            .field("cached", &self.cached_count())
            .field("revision", &self.revision)
            .finish_non_exhaustive()
    }
}

impl SettingsEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            definitions: DefinitionStore::new(),
            graph: StackGraph::new(),
            functions: FunctionRegistry::with_builtins(),
            config,
            state: RwLock::new(ResolutionState::default()),
            evaluations: AtomicU64::new(0),
            revision: 0,
            observers: Mutex::new(Vec::new()),
        }
    }

    // =========================================================================
    // Definitions, functions, observers
    // =========================================================================

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn definitions(&self) -> &DefinitionStore {
        &self.definitions
    }

    pub fn register_definition(&mut self, raw: RawDefinition) -> Result<(), DefinitionError> {
        self.definitions.register(raw)
    }

    pub fn register_definition_json(&mut self, text: &str) -> Result<String, DefinitionError> {
        self.definitions.register_json(text)
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// Add or replace a formula function. Cached results may have used the
    /// old catalogue, so the cache is dropped.
    pub fn register_function(&mut self, name: &str, arity: Arity, implementation: FunctionImpl, summary: &'static str) {
        self.functions.register(name, arity, implementation, summary);
        self.state.get_mut().clear();
        tracing::debug!(function = name, "registered function; cache cleared");
    }

    pub fn subscribe(&mut self, callback: EventCallback) {
        self.observers.get_mut().push(callback);
    }

    fn emit(&mut self, event: ChangeEvent) {
        for observer in self.observers.get_mut().iter_mut() {
            observer(event.clone());
        }
    }

    /// Incremented by every successful write.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Number of property computations performed so far (cache misses).
    pub fn evaluation_count(&self) -> u64 {
        self.evaluations.load(Ordering::Relaxed)
    }

    pub fn cached_count(&self) -> usize {
        self.state.read().cache.len()
    }

    pub fn is_cached(&self, stack: StackId, key: &str, property: &str) -> bool {
        self.state.read().cache.contains(&PropertyId::new(stack, key, property))
    }

    // =========================================================================
    // Stack graph
    // =========================================================================

    pub fn graph(&self) -> &StackGraph {
        &self.graph
    }

    pub fn stack(&self, id: StackId) -> Result<&ContainerStack, StackError> {
        self.graph.get(id)
    }

    /// Load `family` and create a global stack for it.
    pub fn create_machine(&mut self, family: &str, name: &str) -> Result<StackId, StackError> {
        let definition = self.definitions.load(family)?;
        let id = self.graph.add_global(name, definition);
        tracing::debug!(stack = %id, family, name, "created machine");
        Ok(id)
    }

    pub fn add_extruder(&mut self, global: StackId, name: &str) -> Result<StackId, StackError> {
        let id = self.graph.add_extruder(global, name)?;
        self.rewired(global, id, RewireReason::ExtruderAdded)?;
        Ok(id)
    }

    pub fn extruder_stack(&self, global: StackId, index: i64) -> Result<StackId, StackError> {
        self.graph.extruder_stack(global, index)
    }

    pub fn set_extruder_enabled(&mut self, global: StackId, index: i64, enabled: bool) -> Result<(), StackError> {
        let id = self.graph.set_extruder_enabled(global, index, enabled)?;
        self.rewired(global, id, RewireReason::ExtruderEnabled(enabled))
    }

    pub fn add_object(&mut self, global: StackId, name: &str, position: i64) -> Result<StackId, StackError> {
        let id = self.graph.add_object(global, name, position)?;
        self.rewired(global, id, RewireReason::ObjectAdded)?;
        Ok(id)
    }

    /// Bind an object stack to another extruder.
    pub fn rebind_object(&mut self, object: StackId, position: i64) -> Result<(), StackError> {
        let global = self.graph.global_of(object)?;
        self.graph.rebind_object(object, position)?;
        self.rewired(global, object, RewireReason::ObjectRebound { position })
    }

    pub fn remove_object(&mut self, object: StackId) -> Result<(), StackError> {
        let global = self.graph.global_of(object)?;
        // Evict while the object is still part of the machine.
        self.state.get_mut().invalidate_stacks(&[object]);
        self.graph.remove_object(object)?;
        self.rewired(global, object, RewireReason::ObjectRemoved)?;
        self.state.get_mut().deps.remove_stack(object);
        Ok(())
    }

    /// Swap a shared preset slot. `None` empties it.
    pub fn set_preset(
        &mut self,
        stack: StackId,
        layer: PresetLayer,
        container: Option<SharedContainer>,
    ) -> Result<Option<SharedContainer>, StackError> {
        let global = self.graph.global_of(stack)?;
        let previous = self.graph.get_mut(stack)?.set_preset(layer, container);
        self.rewired(global, stack, RewireReason::PresetChanged(layer))?;
        Ok(previous)
    }

    /// Install a loaded user or definition_changes container as a stack's layer.
    pub fn set_writable_layer(
        &mut self,
        stack: StackId,
        container: WritableContainer,
    ) -> Result<Option<WritableContainer>, StackError> {
        let global = self.graph.global_of(stack)?;
        let previous = self.graph.get_mut(stack)?.replace_writable(container);
        self.rewired(global, stack, RewireReason::WritableLayerReplaced)?;
        Ok(previous)
    }

    /// Concrete stack a read or edit of `key` aimed at `target` lands on.
    ///
    /// Beyond the structural routing of [`StackGraph::route`], a global-level
    /// target for a key with `limit_to_extruder` goes to that extruder.
    pub fn route(&self, global: StackId, key: &str, target: RouteTarget) -> Result<StackId, StackError> {
        let routed = self.graph.route(global, key, target)?;
        if target != RouteTarget::Global {
            return Ok(routed);
        }
        let stack = self.graph.get(global)?;
        let Some(definition) = stack.definition().get(key) else {
            return Ok(routed);
        };
        let mut resolver = Resolver::new(self);
        match resolver.redirect(stack, definition, "value")? {
            Some(Redirect::LimitToExtruder(extruder)) => Ok(extruder),
            _ => Ok(routed),
        }
    }

    fn rewired(&mut self, global: StackId, stack: StackId, reason: RewireReason) -> Result<(), StackError> {
        let stacks = self.graph.machine_stacks(global)?;
        let evicted = self.state.get_mut().invalidate_stacks(&stacks);
        self.revision += 1;
        tracing::debug!(stack = %stack, ?reason, evicted, "stack rewired");
        let revision = self.revision;
        self.emit(ChangeEvent::StackRewired(StackRewiredEvent { revision, stack, reason }));
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Resolved property, or `None` when the stack, the key or the property
    /// does not exist. A failed formula reads as `Value::Undefined`, and
    /// `validationState` is always defined for a defined non-category key.
    pub fn get_property(&self, stack: StackId, key: &str, property: &str) -> Option<Value> {
        match self.try_get_property(stack, key, property) {
            Ok(value) => value,
            Err(StackError::Expression(e)) if property == VALIDATION_STATE => {
                tracing::debug!(stack = %stack, key, error = %e, "validation failed");
                Some(Value::String(ValidationState::Error.tag().to_string()))
            }
            Err(StackError::Expression(_)) => Some(Value::Undefined),
            Err(_) => None,
        }
    }

    /// Like [`get_property`](Self::get_property) but surfaces the failure.
    pub fn try_get_property(&self, stack: StackId, key: &str, property: &str) -> Result<Option<Value>, StackError> {
        self.graph.get(stack)?;
        let mut resolver = Resolver::new(self);
        Ok(resolver.get(PropertyId::new(stack, key, property))?)
    }

    /// Shorthand for the `value` property.
    pub fn value(&self, stack: StackId, key: &str) -> Option<Value> {
        self.get_property(stack, key, "value")
    }

    pub fn validation_state(&self, stack: StackId, key: &str) -> Result<ValidationState, StackError> {
        let definition = self.definition_of(stack, key)?;
        if definition.is_category() {
            return Err(StackError::ReadOnlyKey {
                key: key.to_string(),
                property: VALIDATION_STATE.to_string(),
                stack,
            });
        }
        let state = self
            .get_property(stack, key, VALIDATION_STATE)
            .and_then(|v| v.as_str().and_then(ValidationState::from_tag))
            .unwrap_or(ValidationState::Error);
        Ok(state)
    }

    /// Trace which layer supplied the raw `value` of `key`.
    pub fn explain(&self, stack: StackId, key: &str) -> Result<Explanation, StackError> {
        let definition = self.definition_of(stack, key)?;
        let container_stack = self.graph.get(stack)?;
        let mut resolver = Resolver::new(self);
        let redirect = resolver.redirect(container_stack, definition, "value")?;
        let walked = resolver.raw_walk(container_stack, key, "value")?;
        let (raw, source) = match walked {
            Some((raw, source)) => (Some(raw), Some(source)),
            None => (None, None),
        };
        let references = match raw.as_ref().and_then(PropertyValue::as_expression) {
            Some(expr) => expr.references(),
            None => Vec::new(),
        };
        let value = resolver.get(PropertyId::new(stack, key, "value"));
        Ok(Explanation {
            stack,
            key: key.to_string(),
            redirect,
            source,
            raw,
            references,
            value,
        })
    }

    fn definition_of(&self, stack: StackId, key: &str) -> Result<&SettingDefinition, StackError> {
        self.graph
            .get(stack)?
            .definition()
            .get(key)
            .ok_or_else(|| StackError::UnknownSetting {
                key: key.to_string(),
                stack,
            })
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Store `value` in the stack's user layer.
    pub fn set_property(&mut self, stack: StackId, key: &str, property: &str, value: PropertyValue) -> Result<(), StackError> {
        self.set_property_in(stack, WritableLayer::User, key, property, value)
    }

    /// Store a literal `value` in the user layer.
    pub fn set_value(&mut self, stack: StackId, key: &str, value: impl Into<Value>) -> Result<(), StackError> {
        self.set_property(stack, key, "value", PropertyValue::Literal(value.into()))
    }

    /// Parse and store a formula. A syntax error is rejected before anything
    /// is written.
    pub fn set_formula(
        &mut self,
        stack: StackId,
        layer: WritableLayer,
        key: &str,
        property: &str,
        source: &str,
    ) -> Result<(), StackError> {
        let formula = PropertyValue::formula(source)?;
        self.set_property_in(stack, layer, key, property, formula)
    }

    pub fn set_property_in(
        &mut self,
        stack: StackId,
        layer: WritableLayer,
        key: &str,
        property: &str,
        value: PropertyValue,
    ) -> Result<(), StackError> {
        self.check_write(stack, layer, key, property)?;
        self.graph
            .get_mut(stack)?
            .writable_mut(layer)
            .set_property(key, property, value);
        self.after_write(stack, key, property);
        Ok(())
    }

    /// Drop a stored property. Returns false when there was nothing to remove.
    pub fn remove_property(
        &mut self,
        stack: StackId,
        layer: WritableLayer,
        key: &str,
        property: &str,
    ) -> Result<bool, StackError> {
        self.definition_of(stack, key)?;
        let removed = self
            .graph
            .get_mut(stack)?
            .writable_existing_mut(layer)
            .and_then(|c| c.remove_property(key, property))
            .is_some();
        if removed {
            self.after_write(stack, key, property);
        }
        Ok(removed)
    }

    /// Empty the user layer. Returns the keys that had values.
    pub fn clear_user_changes(&mut self, stack: StackId) -> Result<Vec<String>, StackError> {
        let cleared = match self.graph.get_mut(stack)?.writable_existing_mut(WritableLayer::User) {
            Some(user) => user.clear(),
            None => Vec::new(),
        };
        for key in &cleared {
            self.after_write(stack, key, "value");
        }
        Ok(cleared)
    }

    /// Evict every cached property that depends on `(stack, key)`.
    pub fn invalidate(&mut self, stack: StackId, key: &str) -> usize {
        self.state.get_mut().invalidate([SettingRef::new(stack, key)])
    }

    /// Guard for writes. Rejections leave every container untouched.
    fn check_write(&self, stack: StackId, layer: WritableLayer, key: &str, property: &str) -> Result<(), StackError> {
        let definition = self.definition_of(stack, key)?;
        let read_only = || StackError::ReadOnlyKey {
            key: key.to_string(),
            property: property.to_string(),
            stack,
        };

        if definition.is_category() {
            return Err(read_only());
        }

        let property_allowed = match layer {
            WritableLayer::User => property == "value",
            WritableLayer::DefinitionChanges => {
                property == "value" || property == "enabled" || Bound::ALL.iter().any(|b| b.property() == property)
            }
        };
        if !property_allowed {
            return Err(read_only());
        }

        let settable = match self.graph.get(stack)?.kind() {
            StackKind::Global => definition.settable_globally,
            StackKind::Extruder { .. } => definition.settable_per_extruder,
            StackKind::Object { .. } => definition.settable_per_mesh,
        };
        if !settable {
            return Err(read_only());
        }
        Ok(())
    }

    fn after_write(&mut self, stack: StackId, key: &str, property: &str) {
        let invalidated = self.state.get_mut().invalidate([SettingRef::new(stack, key)]);
        self.revision += 1;
        tracing::debug!(stack = %stack, key, property, invalidated, revision = self.revision, "property written");
        let event = PropertyChangedEvent {
            revision: self.revision,
            stack,
            key: key.to_string(),
            property: property.to_string(),
            invalidated,
        };
        self.emit(ChangeEvent::PropertyChanged(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerType, InstanceContainer};
    use crate::error::EvalError;
    use crate::harness::{Fixture, FAMILY};
    use proptest::prelude::*;

    fn quality(key: &str, value: Value) -> SharedContainer {
        let mut c = InstanceContainer::new("normal_quality", ContainerType::Quality);
        c.set_property(key, "value", value.into());
        c.into_shared()
    }

    #[test]
    fn test_user_layer_wins_over_quality() {
        let mut fx = Fixture::new();
        fx.engine
            .set_preset(fx.global, PresetLayer::Quality, Some(quality("layer_height", Value::Float(0.15))))
            .unwrap();
        assert_eq!(fx.engine.value(fx.global, "layer_height"), Some(Value::Float(0.15)));

        fx.engine.set_value(fx.global, "layer_height", 0.3).unwrap();
        assert_eq!(fx.engine.value(fx.global, "layer_height"), Some(Value::Float(0.3)));
    }

    #[test]
    fn test_fallback_chain_as_layers_are_removed() {
        let mut fx = Fixture::new();
        let layer = |id: &str, ty, v: f64| {
            let mut c = InstanceContainer::new(id, ty);
            c.set_property("wall_thickness", "value", Value::Float(v).into());
            c.into_shared()
        };
        let g = fx.global;
        fx.engine.set_preset(g, PresetLayer::Quality, Some(layer("q", ContainerType::Quality, 1.2))).unwrap();
        fx.engine.set_preset(g, PresetLayer::Material, Some(layer("m", ContainerType::Material, 1.0))).unwrap();
        fx.engine.set_preset(g, PresetLayer::Variant, Some(layer("v", ContainerType::Variant, 0.9))).unwrap();
        fx.engine.set_value(g, "wall_thickness", 2.0).unwrap();

        assert_eq!(fx.engine.value(g, "wall_thickness"), Some(Value::Float(2.0)));
        assert!(fx.engine.remove_property(g, WritableLayer::User, "wall_thickness", "value").unwrap());
        assert_eq!(fx.engine.value(g, "wall_thickness"), Some(Value::Float(1.2)));
        fx.engine.set_preset(g, PresetLayer::Quality, None).unwrap();
        assert_eq!(fx.engine.value(g, "wall_thickness"), Some(Value::Float(1.0)));
        fx.engine.set_preset(g, PresetLayer::Material, None).unwrap();
        assert_eq!(fx.engine.value(g, "wall_thickness"), Some(Value::Float(0.9)));
        fx.engine.set_preset(g, PresetLayer::Variant, None).unwrap();
        // definition formula: line_width * 2 = 0.8
        assert_eq!(fx.engine.value(g, "wall_thickness"), Some(Value::Float(0.8)));
    }

    proptest! {
        #[test]
        fn prop_highest_present_layer_wins(present in proptest::collection::vec(any::<bool>(), 5)) {
            let mut fx = Fixture::new();
            let g = fx.global;
            // user, quality, material, variant, definition_changes; values 5..1
            let presets = [(PresetLayer::Quality, ContainerType::Quality), (PresetLayer::Material, ContainerType::Material), (PresetLayer::Variant, ContainerType::Variant)];
            if present[0] {
                fx.engine.set_value(g, "speed_print", 5.0).unwrap();
            }
            for (i, (layer, ty)) in presets.iter().enumerate() {
                if present[i + 1] {
                    let mut c = InstanceContainer::new(format!("c{}", i), *ty);
                    c.set_property("speed_print", "value", Value::Float((4 - i) as f64).into());
                    fx.engine.set_preset(g, *layer, Some(c.into_shared())).unwrap();
                }
            }
            if present[4] {
                fx.engine
                    .set_property_in(g, WritableLayer::DefinitionChanges, "speed_print", "value", Value::Float(1.0).into())
                    .unwrap();
            }

            let expected = present
                .iter()
                .position(|p| *p)
                .map(|i| 5.0 - i as f64)
                .unwrap_or(60.0);
            prop_assert_eq!(fx.engine.value(g, "speed_print"), Some(Value::Float(expected)));
        }
    }

    #[test]
    fn test_formula_recomputes_after_write() {
        let mut fx = Fixture::new();
        let g = fx.global;
        fx.engine.set_value(g, "layer_height", 0.2).unwrap();
        assert_eq!(fx.engine.value(g, "layer_height_0"), Some(Value::Float(0.4)));

        fx.engine.set_value(g, "layer_height", 0.3).unwrap();
        let v = fx.engine.value(g, "layer_height_0").unwrap().as_f64().unwrap();
        assert!((v - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_invalidation_is_transitive() {
        let mut fx = Fixture::new();
        let g = fx.global;
        // wall_line_count reads wall_thickness, which reads line_width
        assert_eq!(fx.engine.value(g, "wall_line_count"), Some(Value::Int(2)));
        assert!(fx.engine.is_cached(g, "wall_thickness", "value"));

        fx.engine.set_value(g, "line_width", 0.5).unwrap();
        assert!(!fx.engine.is_cached(g, "wall_thickness", "value"));
        assert!(!fx.engine.is_cached(g, "wall_line_count", "value"));
        assert_eq!(fx.engine.value(g, "wall_thickness"), Some(Value::Float(1.0)));
        assert_eq!(fx.engine.value(g, "wall_line_count"), Some(Value::Int(2)));

        fx.engine.set_value(g, "wall_thickness", 1.5).unwrap();
        assert_eq!(fx.engine.value(g, "wall_line_count"), Some(Value::Int(3)));
    }

    #[test]
    fn test_cycle_is_reported_not_overflowed() {
        let mut fx = Fixture::new();
        let g = fx.global;
        fx.engine.set_formula(g, WritableLayer::User, "speed_print", "value", "speed_travel / 2").unwrap();
        fx.engine.set_formula(g, WritableLayer::User, "speed_travel", "value", "speed_print * 2").unwrap();

        match fx.engine.try_get_property(g, "speed_print", "value").unwrap_err() {
            StackError::Expression(EvalError::EvaluationCycle(chain)) => {
                assert_eq!(chain.first(), chain.last());
                assert_eq!(chain.len(), 3);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
        assert_eq!(fx.engine.value(g, "speed_print"), Some(Value::Undefined));
        assert_eq!(fx.engine.validation_state(g, "speed_print").unwrap(), ValidationState::Error);
        // unrelated keys still resolve
        assert_eq!(fx.engine.value(g, "layer_height"), Some(Value::Float(0.1)));
        // cycles are not cached
        assert!(!fx.engine.is_cached(g, "speed_print", "value"));
    }

    #[test]
    fn test_repeated_reference_is_not_a_cycle() {
        let mut fx = Fixture::new();
        let g = fx.global;
        fx.engine.set_formula(g, WritableLayer::User, "speed_travel", "value", "speed_print + speed_print * 2").unwrap();
        assert_eq!(fx.engine.value(g, "speed_travel"), Some(Value::Float(180.0)));
    }

    #[test]
    fn test_depth_limit() {
        let mut fx = Fixture::with_config(EngineConfig {
            evaluation: crate::config::EvaluationConfig {
                max_depth: 2,
                ..Default::default()
            },
            ..Default::default()
        });
        let g = fx.global;
        // wall_line_count -> wall_thickness -> line_width -> machine_nozzle_size
        assert!(matches!(
            fx.engine.try_get_property(g, "wall_line_count", "value"),
            Err(StackError::Expression(EvalError::MaxDepthExceeded(2)))
        ));
        // the same keys resolve from a shallower entry point
        fx.engine.set_value(g, "machine_nozzle_size", 0.4).unwrap();
        assert_eq!(fx.engine.value(g, "line_width"), Some(Value::Float(0.4)));
    }

    #[test]
    fn test_extruder_value_reads_other_stack() {
        let mut fx = Fixture::new();
        let g = fx.global;
        fx.engine.set_value(fx.extruders[1], "wall_thickness", 1.5).unwrap();
        fx.engine.set_value(g, "wall_thickness", 0.4).unwrap();
        fx.engine
            .set_formula(g, WritableLayer::User, "speed_travel", "value", "extruderValue(1, 'wall_thickness') * 100")
            .unwrap();

        assert_eq!(fx.engine.value(g, "speed_travel"), Some(Value::Float(150.0)));
        assert_eq!(fx.engine.value(g, "wall_thickness"), Some(Value::Float(0.4)));

        // cross-stack edge: writing the extruder invalidates the global formula
        fx.engine.set_value(fx.extruders[1], "wall_thickness", 2.0).unwrap();
        assert_eq!(fx.engine.value(g, "speed_travel"), Some(Value::Float(200.0)));
    }

    #[test]
    fn test_extruder_value_out_of_range() {
        let mut fx = Fixture::new();
        let g = fx.global;
        fx.engine
            .set_formula(g, WritableLayer::User, "speed_travel", "value", "extruderValue(7, 'wall_thickness')")
            .unwrap();
        assert_eq!(
            fx.engine.try_get_property(g, "speed_travel", "value").unwrap_err(),
            StackError::Expression(EvalError::IndexOutOfRange { index: 7, len: 2 })
        );
    }

    #[test]
    fn test_extruder_falls_through_to_global() {
        let mut fx = Fixture::new();
        let e0 = fx.extruders[0];
        assert_eq!(fx.engine.value(e0, "layer_height"), Some(Value::Float(0.1)));

        fx.engine.set_value(fx.global, "wall_thickness", 1.2).unwrap();
        assert_eq!(fx.engine.value(e0, "wall_thickness"), Some(Value::Float(1.2)));
        // edge recorded by the walk into the global stack
        fx.engine.set_value(fx.global, "wall_thickness", 1.4).unwrap();
        assert_eq!(fx.engine.value(e0, "wall_thickness"), Some(Value::Float(1.4)));
    }

    #[test]
    fn test_extruder_formula_uses_its_own_values() {
        let mut fx = Fixture::new();
        let (e0, e1) = (fx.extruders[0], fx.extruders[1]);
        fx.engine.set_value(e1, "machine_nozzle_size", 0.8).unwrap();
        // definition formula line_width = machine_nozzle_size, evaluated per stack
        assert_eq!(fx.engine.value(e0, "line_width"), Some(Value::Float(0.4)));
        assert_eq!(fx.engine.value(e1, "line_width"), Some(Value::Float(0.8)));
    }

    #[test]
    fn test_write_guard() {
        let mut fx = Fixture::new();
        let e0 = fx.extruders[0];
        let revision = fx.engine.revision();

        let err = fx.engine.set_value(e0, "machine_height", 300.0).unwrap_err();
        assert!(matches!(err, StackError::ReadOnlyKey { ref key, .. } if key == "machine_height"));
        assert!(fx.engine.stack(e0).unwrap().user().is_none());
        assert_eq!(fx.engine.revision(), revision);

        assert!(matches!(
            fx.engine.set_value(fx.global, "resolution", 1i64).unwrap_err(),
            StackError::ReadOnlyKey { .. }
        ));
        assert!(matches!(
            fx.engine.set_value(fx.global, "no_such_key", 1i64).unwrap_err(),
            StackError::UnknownSetting { .. }
        ));
        assert!(matches!(
            fx.engine
                .set_property(fx.global, "layer_height", "minimum_value", Value::Float(0.0).into())
                .unwrap_err(),
            StackError::ReadOnlyKey { .. }
        ));
        assert!(matches!(
            fx.engine.set_formula(fx.global, WritableLayer::User, "layer_height", "value", "1 +").unwrap_err(),
            StackError::Expression(EvalError::Syntax { .. })
        ));
        assert!(fx.engine.stack(fx.global).unwrap().user().is_none());
    }

    #[test]
    fn test_global_only_key_on_extruder_reads_global() {
        let mut fx = Fixture::new();
        fx.engine.set_value(fx.global, "machine_height", 250.0).unwrap();
        assert_eq!(fx.engine.value(fx.extruders[1], "machine_height"), Some(Value::Float(250.0)));
    }

    #[test]
    fn test_idempotent_reads_hit_cache() {
        let fx = Fixture::new();
        let first = fx.engine.value(fx.global, "wall_line_count");
        let evaluations = fx.engine.evaluation_count();
        let second = fx.engine.value(fx.global, "wall_line_count");
        assert_eq!(first, second);
        assert_eq!(fx.engine.evaluation_count(), evaluations);
    }

    #[test]
    fn test_failed_formula_is_undefined_and_error_state() {
        let mut fx = Fixture::new();
        let g = fx.global;
        fx.engine.set_formula(g, WritableLayer::User, "speed_print", "value", "1 / 0").unwrap();
        assert_eq!(fx.engine.value(g, "speed_print"), Some(Value::Undefined));
        assert_eq!(
            fx.engine.try_get_property(g, "speed_print", "value").unwrap_err(),
            StackError::Expression(EvalError::DivisionByZero)
        );
        assert_eq!(fx.engine.validation_state(g, "speed_print").unwrap(), ValidationState::Error);
        // dependents fail too, independent keys do not
        assert!(matches!(
            fx.engine.try_get_property(g, "speed_travel", "value").unwrap_err(),
            StackError::Expression(_)
        ));
        assert_eq!(fx.engine.value(g, "layer_height"), Some(Value::Float(0.1)));
    }

    #[test]
    fn test_validation_states() {
        let mut fx = Fixture::new();
        let g = fx.global;
        assert_eq!(fx.engine.validation_state(g, "layer_height").unwrap(), ValidationState::Valid);
        fx.engine.set_value(g, "layer_height", 0.0005).unwrap();
        assert_eq!(fx.engine.validation_state(g, "layer_height").unwrap(), ValidationState::ExceedsMin);
        // warning bound is 0.8 * machine_nozzle_size = 0.32
        fx.engine.set_value(g, "layer_height", 0.35).unwrap();
        assert_eq!(fx.engine.validation_state(g, "layer_height").unwrap(), ValidationState::Warning);
        fx.engine.set_value(g, "machine_nozzle_size", 0.6).unwrap();
        assert_eq!(fx.engine.validation_state(g, "layer_height").unwrap(), ValidationState::Valid);
        fx.engine.set_value(g, "layer_height", 2.0).unwrap();
        assert_eq!(fx.engine.validation_state(g, "layer_height").unwrap(), ValidationState::ExceedsMax);
        assert_eq!(
            fx.engine.get_property(g, "layer_height", VALIDATION_STATE),
            Some(Value::String("exceeds_max".into()))
        );

        fx.engine.set_value(g, "adhesion_type", "raft_of_doom").unwrap();
        assert_eq!(fx.engine.validation_state(g, "adhesion_type").unwrap(), ValidationState::Error);
    }

    #[test]
    fn test_int_setting_truncates() {
        let mut fx = Fixture::new();
        let g = fx.global;
        fx.engine.set_value(g, "wall_thickness", 1.19).unwrap();
        // 1.19 / 0.4 = 2.975 -> 2
        assert_eq!(fx.engine.value(g, "wall_line_count"), Some(Value::Int(2)));
    }

    #[test]
    fn test_global_resolve_aggregates_extruders() {
        let mut fx = Fixture::new();
        let g = fx.global;
        fx.engine.set_value(fx.extruders[1], "material_bed_temperature", 80.0).unwrap();
        // resolve = max(extruderValues('material_bed_temperature'))
        assert_eq!(fx.engine.value(g, "material_bed_temperature"), Some(Value::Float(80.0)));

        // a user value on the global stack beats resolve
        fx.engine.set_value(g, "material_bed_temperature", 55.0).unwrap();
        assert_eq!(fx.engine.value(g, "material_bed_temperature"), Some(Value::Float(55.0)));

        fx.engine.clear_user_changes(g).unwrap();
        fx.engine.set_extruder_enabled(g, 1, false).unwrap();
        assert_eq!(fx.engine.value(g, "material_bed_temperature"), Some(Value::Float(60.0)));
    }

    #[test]
    fn test_resolve_or_value_reads_global_resolution() {
        let mut fx = Fixture::new();
        fx.engine.set_value(fx.extruders[0], "material_bed_temperature", 70.0).unwrap();
        fx.engine
            .set_formula(fx.extruders[1], WritableLayer::User, "speed_print", "value", "resolveOrValue('material_bed_temperature')")
            .unwrap();
        assert_eq!(fx.engine.value(fx.extruders[1], "speed_print"), Some(Value::Float(70.0)));
    }

    #[test]
    fn test_limit_to_extruder_redirects_global_read() {
        let mut fx = Fixture::new();
        let g = fx.global;
        fx.engine.set_value(fx.extruders[1], "support_speed", 33.0).unwrap();
        assert_eq!(fx.engine.value(g, "support_speed"), Some(Value::Float(60.0)));

        fx.engine.set_value(g, "support_extruder_nr", 1i64).unwrap();
        assert_eq!(fx.engine.value(g, "support_speed"), Some(Value::Float(33.0)));
        assert_eq!(fx.engine.route(g, "support_speed", RouteTarget::Global).unwrap(), fx.extruders[1]);
    }

    #[test]
    fn test_default_extruder_limit_applies_to_global_only() {
        let mut fx = Fixture::new();
        let g = fx.global;
        fx.engine.set_value(fx.extruders[1], "support_speed", 33.0).unwrap();
        fx.engine.set_value(g, "support_extruder_nr", -1i64).unwrap();

        assert_eq!(fx.engine.value(g, "support_speed"), Some(Value::Float(60.0)));
        assert_eq!(fx.engine.value(fx.extruders[1], "support_speed"), Some(Value::Float(33.0)));

        fx.engine.set_extruder_enabled(g, 0, false).unwrap();
        assert_eq!(fx.engine.value(g, "support_speed"), Some(Value::Float(33.0)));
        assert_eq!(fx.engine.value(fx.extruders[0], "support_speed"), Some(Value::Float(60.0)));
    }

    #[test]
    fn test_any_extruder_with_material() {
        let mut fx = Fixture::new();
        let g = fx.global;
        assert_eq!(fx.engine.value(g, "has_abrasive_material"), Some(Value::Bool(false)));

        let mut material = InstanceContainer::new("cf_nylon", ContainerType::Material);
        material.set_metadata("abrasive", serde_json::json!(true));
        fx.engine
            .set_preset(fx.extruders[1], PresetLayer::Material, Some(material.into_shared()))
            .unwrap();
        assert_eq!(fx.engine.value(g, "has_abrasive_material"), Some(Value::Bool(true)));

        fx.engine.set_extruder_enabled(g, 1, false).unwrap();
        assert_eq!(fx.engine.value(g, "has_abrasive_material"), Some(Value::Bool(false)));
    }

    #[test]
    fn test_object_stack_override() {
        let mut fx = Fixture::new();
        let g = fx.global;
        let obj = fx.engine.add_object(g, "bracket", 1).unwrap();
        fx.engine.set_value(fx.extruders[1], "wall_thickness", 1.6).unwrap();
        assert_eq!(fx.engine.value(obj, "wall_thickness"), Some(Value::Float(1.6)));

        fx.engine.set_value(obj, "wall_thickness", 2.4).unwrap();
        assert_eq!(fx.engine.value(obj, "wall_thickness"), Some(Value::Float(2.4)));
        assert!(matches!(
            fx.engine.set_value(obj, "material_print_temperature", 210.0).unwrap_err(),
            StackError::ReadOnlyKey { .. }
        ));

        fx.engine.remove_property(obj, WritableLayer::User, "wall_thickness", "value").unwrap();
        fx.engine.rebind_object(obj, 0).unwrap();
        assert_eq!(fx.engine.value(obj, "wall_thickness"), Some(Value::Float(0.8)));

        fx.engine.remove_object(obj).unwrap();
        assert_eq!(fx.engine.value(obj, "wall_thickness"), None);
    }

    #[test]
    fn test_remove_object_evicts_its_entries() {
        let mut fx = Fixture::new();
        let obj = fx.engine.add_object(fx.global, "bracket", 0).unwrap();
        fx.engine.set_value(obj, "wall_thickness", 2.4).unwrap();
        assert_eq!(fx.engine.value(obj, "wall_thickness"), Some(Value::Float(2.4)));
        assert!(fx.engine.is_cached(obj, "wall_thickness", "value"));
        let before = fx.engine.cached_count();
        assert!(before >= 1);

        fx.engine.remove_object(obj).unwrap();
        assert!(!fx.engine.is_cached(obj, "wall_thickness", "value"));
        assert_eq!(fx.engine.cached_count(), 0);
    }

    #[test]
    fn test_enabled_property() {
        let mut fx = Fixture::new();
        let g = fx.global;
        assert_eq!(fx.engine.get_property(g, "support_speed", "enabled"), Some(Value::Bool(false)));
        fx.engine.set_value(g, "support_enable", true).unwrap();
        assert_eq!(fx.engine.get_property(g, "support_speed", "enabled"), Some(Value::Bool(true)));
    }

    #[test]
    fn test_unknown_reads_are_none() {
        let fx = Fixture::new();
        assert_eq!(fx.engine.get_property(fx.global, "nope", "value"), None);
        assert_eq!(fx.engine.get_property(fx.global, "layer_height", "no_such_property"), None);
        assert_eq!(fx.engine.get_property(StackId(999), "layer_height", "value"), None);
        assert_eq!(fx.engine.get_property(fx.global, "resolution", "value"), None);
        assert_eq!(
            fx.engine.get_property(fx.global, "layer_height", "unit"),
            Some(Value::String("mm".into()))
        );
    }

    #[test]
    fn test_events_follow_invalidation() {
        let mut fx = Fixture::new();
        let g = fx.global;
        let collector = fx.watch();

        fx.engine.value(g, "layer_height_0");
        fx.engine.set_value(g, "layer_height", 0.2).unwrap();
        fx.engine.set_preset(g, PresetLayer::Quality, None).unwrap();
        let _ = fx.engine.set_value(fx.extruders[0], "machine_height", 1.0);

        let events = collector.lock();
        assert_eq!(events.len(), 2);
        let changed = events.property_changed();
        assert_eq!(changed[0].key, "layer_height");
        assert_eq!(changed[0].property, "value");
        assert!(changed[0].invalidated >= 2);
        assert_eq!(events.stack_rewired()[0].reason, RewireReason::PresetChanged(PresetLayer::Quality));
        assert!(events.events()[0].revision() < events.events()[1].revision());
    }

    #[test]
    fn test_registered_function_usable_in_formulas() {
        fn double(_: &mut dyn crate::expr::ResolutionContext, args: &[Value]) -> Result<Value, EvalError> {
            crate::expr::eval::binary(crate::expr::parser::BinOp::Mul, &args[0], &Value::Int(2))
        }
        let mut fx = Fixture::new();
        let g = fx.global;
        fx.engine.register_function("double", Arity::Exact(1), double, "Twice the argument");
        fx.engine.set_formula(g, WritableLayer::User, "speed_travel", "value", "double(speed_print)").unwrap();
        assert_eq!(fx.engine.value(g, "speed_travel"), Some(Value::Float(120.0)));
    }

    #[test]
    fn test_explain_names_layer() {
        let mut fx = Fixture::new();
        let g = fx.global;
        let e = fx.engine.explain(g, "layer_height_0").unwrap();
        assert_eq!(e.source, Some(LayerSource::Definition { family: FAMILY.into() }));
        assert_eq!(e.references, vec!["layer_height"]);

        fx.engine.set_value(g, "layer_height_0", 0.3).unwrap();
        let e = fx.engine.explain(fx.extruders[0], "layer_height_0").unwrap();
        match e.source {
            Some(LayerSource::Container { stack, container_type, .. }) => {
                assert_eq!(stack, g);
                assert_eq!(container_type, ContainerType::User);
            }
            other => panic!("unexpected source {:?}", other),
        }
        assert_eq!(e.value, Ok(Some(Value::Float(0.3))));
    }

    #[test]
    fn test_concurrent_readers_agree() {
        let fx = Fixture::new();
        let engine = &fx.engine;
        let keys = ["wall_line_count", "layer_height_0", "speed_travel", "material_bed_temperature"];
        let results: Vec<Vec<Option<Value>>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| keys.iter().map(|k| engine.value(fx.global, k)).collect::<Vec<_>>()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for r in &results[1..] {
            assert_eq!(r, &results[0]);
        }
        assert_eq!(results[0][0], Some(Value::Int(2)));
    }
}
