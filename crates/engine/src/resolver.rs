//! Per-call property resolution.
//!
//! A [`Resolver`] lives for one top-level read. It carries the evaluation
//! chain (the cycle guard) and one dependency frame per property being
//! computed. Every `get` records the requested setting into the caller's
//! frame; when a computation finishes its frame becomes that property's
//! precedents in the dependency graph, and the result goes into the cache.
//!
//! Concurrent reads each have their own resolver, so "on my call chain" and
//! "already cached" never get confused across threads.
//!
//! # Resolution of `(S, K, P)`
//!
//! 1. `K` unknown to S's definition: `None`.
//! 2. `P == validationState`: computed from value and bounds.
//! 3. Redirects (see [`Redirect`]): global-only keys on extruder/object
//!    stacks go to the next stack, `resolve` replaces `value` on a global
//!    stack, `limit_to_extruder` sends the read to the owning extruder.
//! 4. Raw walk: S's layers in priority order, then each `next_stack`'s
//!    layers, then the definition. Formulas are evaluated in S's context.
//! 5. `value`/`resolve` are coerced to the setting type; `enabled` to bool.

use std::sync::atomic::Ordering;

use rustc_hash::FxHashSet;

use crate::cache::Resolved;
use crate::container::{ContainerType, PresetLayer, PropertyValue};
use crate::definition::SettingDefinition;
use crate::engine::SettingsEngine;
use crate::error::EvalError;
use crate::expr::{evaluate, FunctionRegistry, ResolutionContext};
use crate::setting_id::{PropertyId, SettingRef, StackId};
use crate::stack::{ContainerStack, LayerSource, StackKind};
use crate::validation::{self, VALIDATION_STATE};
use crate::value::{coerce, Value};

/// Where a read is sent instead of the stack it was asked of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redirect {
    /// Key not settable on this stack kind; read it from the next stack.
    Delegate(StackId),
    /// Global `value` computed by the definition's `resolve` formula.
    Resolve,
    /// `limit_to_extruder` names another extruder.
    LimitToExtruder(StackId),
}

pub(crate) struct Resolver<'a> {
    engine: &'a SettingsEngine,
    chain: Vec<PropertyId>,
    frames: Vec<FxHashSet<SettingRef>>,
}

impl<'a> Resolver<'a> {
    pub fn new(engine: &'a SettingsEngine) -> Self {
        Self {
            engine,
            chain: Vec::new(),
            frames: vec![FxHashSet::default()],
        }
    }

    /// Resolve one property, from cache when possible.
    pub fn get(&mut self, id: PropertyId) -> Resolved {
        if let Some(frame) = self.frames.last_mut() {
            frame.insert(id.setting.clone());
        }

        if let Some(start) = self.chain.iter().position(|p| *p == id) {
            let mut cycle: Vec<String> = self.chain[start..].iter().map(|p| self.label(p)).collect();
            cycle.push(self.label(&id));
            return Err(EvalError::EvaluationCycle(cycle));
        }

        let max_depth = self.engine.config.evaluation.max_depth;
        if self.chain.len() >= max_depth {
            return Err(EvalError::MaxDepthExceeded(max_depth));
        }

        if let Some(hit) = self.engine.state.read().cache.get(&id) {
            return hit.clone();
        }

        self.chain.push(id.clone());
        self.frames.push(FxHashSet::default());
        let result = self.compute(&id);
        let precedents = self.frames.pop().unwrap_or_default();
        self.chain.pop();

        self.engine.evaluations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(property = %id, result = ?result, "evaluated");

        match &result {
            Err(e) if e.is_chain_dependent() => {}
            _ => {
                let mut state = self.engine.state.write();
                state.deps.replace_edges(id.clone(), precedents);
                state.cache.insert(id, result.clone());
            }
        }
        result
    }

    /// `value` of `key` in `stack`, as a formula identifier sees it.
    pub fn value_of(&mut self, stack: StackId, key: &str) -> Result<Value, EvalError> {
        match self.get(PropertyId::new(stack, key, "value"))? {
            Some(v) if !v.is_undefined() => Ok(v),
            _ => Err(self.unresolved(stack, key)),
        }
    }

    fn compute(&mut self, id: &PropertyId) -> Resolved {
        let engine = self.engine;
        let stack_id = id.stack();
        let key = id.key();
        let property = &*id.property;

        let Ok(stack) = engine.graph.get(stack_id) else {
            return Ok(None);
        };
        let Some(definition) = stack.definition().get(key) else {
            return Ok(None);
        };

        if property == VALIDATION_STATE {
            if definition.is_category() {
                return Ok(None);
            }
            let state = validation::compute(self, stack_id, definition)?;
            return Ok(Some(Value::String(state.tag().to_string())));
        }

        match self.redirect(stack, definition, property)? {
            Some(Redirect::Delegate(next)) | Some(Redirect::LimitToExtruder(next)) => {
                return self.get(PropertyId::new(next, key, property));
            }
            Some(Redirect::Resolve) => {
                let resolved = self.get(PropertyId::new(stack_id, key, "resolve"))?;
                return self.finish(definition, property, resolved);
            }
            None => {}
        }

        let Some((raw, _)) = self.raw_walk(stack, key, property)? else {
            return Ok(None);
        };
        let value = match raw {
            PropertyValue::Literal(v) => v,
            PropertyValue::Expression(expr) => {
                let mut ctx = StackContext {
                    resolver: self,
                    stack: stack_id,
                };
                match evaluate(&expr, &mut ctx) {
                    Ok(v) => v,
                    Err(e) => {
                        if !e.is_chain_dependent() {
                            tracing::warn!(stack = %stack_id, key, property, error = %e, "formula failed");
                        }
                        return Err(e);
                    }
                }
            }
        };
        self.finish(definition, property, Some(value))
    }

    fn finish(&self, definition: &SettingDefinition, property: &str, value: Option<Value>) -> Resolved {
        let Some(value) = value else {
            return Ok(None);
        };
        let value = match property {
            "value" | "resolve" => {
                let rounding = definition
                    .int_rounding
                    .unwrap_or(self.engine.config.evaluation.int_coercion);
                coerce(value, definition.setting_type, rounding)?
            }
            "enabled" => Value::Bool(value.truthy()?),
            _ => value,
        };
        Ok(Some(value))
    }

    /// Decide whether a read of `(stack, key, property)` is answered elsewhere.
    pub fn redirect(
        &mut self,
        stack: &ContainerStack,
        definition: &SettingDefinition,
        property: &str,
    ) -> Result<Option<Redirect>, EvalError> {
        let key = definition.key.as_str();

        let settable_here = match stack.kind() {
            StackKind::Global => true,
            // Resolve formulas read per-extruder values of their own key;
            // sending those reads back to the global value would loop.
            StackKind::Extruder { .. } => {
                definition.settable_per_extruder || (property == "value" && definition.resolve.is_some())
            }
            StackKind::Object { .. } => definition.settable_per_mesh,
        };
        if !settable_here {
            if let Some(next) = stack.next_stack() {
                return Ok(Some(Redirect::Delegate(next)));
            }
        }

        if property == "value"
            && stack.is_global()
            && definition.resolve.is_some()
            && self.engine.graph.extruders(stack.id()).is_ok_and(|e| !e.is_empty())
            && !stack.has_value_in(key, &[ContainerType::User, ContainerType::QualityChanges])
        {
            return Ok(Some(Redirect::Resolve));
        }

        if property != "limit_to_extruder"
            && property != "resolve"
            && definition.limit_to_extruder.is_some()
            && definition.settable_per_extruder
            && !matches!(stack.kind(), StackKind::Object { .. })
        {
            if let Some(target) = self.limit_target(stack, key)? {
                return Ok(Some(Redirect::LimitToExtruder(target)));
            }
        }

        Ok(None)
    }

    fn limit_target(&mut self, stack: &ContainerStack, key: &str) -> Result<Option<StackId>, EvalError> {
        let engine = self.engine;
        let graph = &engine.graph;
        let Ok(global) = graph.global_of(stack.id()) else {
            return Ok(None);
        };
        let limit = self.get(PropertyId::new(stack.id(), key, "limit_to_extruder"))?;
        let position = match limit {
            Some(Value::Int(i)) => i,
            Some(Value::Float(f)) if f.fract() == 0.0 => f as i64,
            Some(Value::String(s)) => match s.trim().parse::<i64>() {
                Ok(i) => i,
                Err(_) => return Ok(None),
            },
            _ => return Ok(None),
        };
        // -1 names the default extruder, which only the global stack defers to.
        let position = if position == -1 {
            if !stack.is_global() {
                return Ok(None);
            }
            match graph.enabled_extruders(global) {
                Ok(enabled) => match enabled.first() {
                    Some((p, _)) => *p as i64,
                    None => return Ok(None),
                },
                Err(_) => return Ok(None),
            }
        } else {
            position
        };
        if stack.extruder_position().map(|p| p as i64) == Some(position) {
            return Ok(None);
        }
        Ok(graph.extruder_stack(global, position).ok())
    }

    /// First stored value of `property` along S's layers, its next stacks'
    /// layers, then the definition. Each next stack visited becomes a precedent.
    pub fn raw_walk(
        &mut self,
        stack: &ContainerStack,
        key: &str,
        property: &str,
    ) -> Result<Option<(PropertyValue, LayerSource)>, EvalError> {
        let engine = self.engine;
        let mut current = stack;
        loop {
            if let Some((layer, value)) = current.raw_property(key, property) {
                let source = LayerSource::Container {
                    stack: current.id(),
                    container_id: layer.id().to_string(),
                    container_type: layer.container_type(),
                };
                return Ok(Some((value.clone(), source)));
            }
            let Some(next) = current.next_stack() else { break };
            if let Some(frame) = self.frames.last_mut() {
                frame.insert(SettingRef::new(next, key));
            }
            current = engine
                .graph
                .get(next)
                .map_err(|_| self.unresolved(next, key))?;
        }

        let definition = stack.definition();
        Ok(definition
            .get(key)
            .and_then(|d| d.property(property))
            .map(|value| {
                (
                    value,
                    LayerSource::Definition {
                        family: definition.family().to_string(),
                    },
                )
            }))
    }

    fn unresolved(&self, stack: StackId, key: &str) -> EvalError {
        EvalError::UnresolvedReference {
            key: key.to_string(),
            stack: self.stack_label(stack),
        }
    }

    fn stack_label(&self, stack: StackId) -> String {
        match self.engine.graph.get(stack) {
            Ok(s) => format!("'{}'", s.name()),
            Err(_) => stack.to_string(),
        }
    }

    fn label(&self, id: &PropertyId) -> String {
        format!("{}:{}.{}", self.stack_label(id.stack()), id.key(), id.property)
    }

    fn global_of(&self, stack: StackId, key: &str) -> Result<StackId, EvalError> {
        self.engine.graph.global_of(stack).map_err(|_| self.unresolved(stack, key))
    }
}

/// Formula context bound to one stack.
struct StackContext<'r, 'a> {
    resolver: &'r mut Resolver<'a>,
    stack: StackId,
}

impl StackContext<'_, '_> {
    fn graph(&self) -> &crate::stack::StackGraph {
        &self.resolver.engine.graph
    }

    fn global(&self) -> Option<StackId> {
        self.graph().global_of(self.stack).ok()
    }
}

impl ResolutionContext for StackContext<'_, '_> {
    fn setting_value(&mut self, key: &str) -> Result<Value, EvalError> {
        self.resolver.value_of(self.stack, key)
    }

    fn extruder_value(&mut self, position: i64, key: &str) -> Result<Value, EvalError> {
        let global = self.resolver.global_of(self.stack, key)?;
        let count = self.graph().extruders(global).map(|e| e.len()).unwrap_or(0);
        if count == 0 {
            return self.resolver.value_of(global, key);
        }
        let position = if position == -1 {
            self.default_extruder_position()
        } else {
            position
        };
        match self.graph().extruder_stack(global, position) {
            Ok(extruder) => self.resolver.value_of(extruder, key),
            Err(_) => Err(EvalError::IndexOutOfRange { index: position, len: count }),
        }
    }

    fn extruder_values(&mut self, key: &str) -> Result<Vec<Value>, EvalError> {
        let global = self.resolver.global_of(self.stack, key)?;
        let enabled = self.graph().enabled_extruders(global).unwrap_or_default();
        if enabled.is_empty() {
            return Ok(vec![self.resolver.value_of(global, key)?]);
        }
        let mut values = Vec::with_capacity(enabled.len());
        for (_, extruder) in enabled {
            values.push(self.resolver.value_of(extruder, key)?);
        }
        Ok(values)
    }

    fn resolve_or_value(&mut self, key: &str) -> Result<Value, EvalError> {
        let global = self.resolver.global_of(self.stack, key)?;
        self.resolver.value_of(global, key)
    }

    fn enabled_extruders(&self) -> Vec<i64> {
        self.global()
            .and_then(|g| self.graph().enabled_extruders(g).ok())
            .map(|e| e.into_iter().map(|(p, _)| p as i64).collect())
            .unwrap_or_default()
    }

    fn material_metadata(&self, position: i64, entry: &str) -> Option<serde_json::Value> {
        let global = self.global()?;
        let extruder = self.graph().extruder_stack(global, position).ok()?;
        self.graph()
            .get(extruder)
            .ok()?
            .preset(PresetLayer::Material)?
            .metadata_entry(entry)
            .cloned()
    }

    fn functions(&self) -> &FunctionRegistry {
        &self.resolver.engine.functions
    }
}
