//! Resolution cache and the state it shares a lock with.
//!
//! Entries are keyed by `PropertyId` and hold the full result of one
//! computation, failures included. A secondary index by setting lets
//! invalidation evict every property of a key at once.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::dep_graph::DepGraph;
use crate::error::EvalError;
use crate::setting_id::{PropertyId, SettingRef, StackId};
use crate::value::Value;

/// `Ok(None)`: the property is not defined anywhere in the stack.
pub type Resolved = Result<Option<Value>, EvalError>;

#[derive(Debug, Default, Clone)]
pub struct ResolutionCache {
    entries: FxHashMap<PropertyId, Resolved>,
    by_setting: FxHashMap<SettingRef, FxHashSet<Arc<str>>>,
}

impl ResolutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, property: &PropertyId) -> Option<&Resolved> {
        self.entries.get(property)
    }

    pub fn contains(&self, property: &PropertyId) -> bool {
        self.entries.contains_key(property)
    }

    pub fn insert(&mut self, property: PropertyId, result: Resolved) {
        self.by_setting
            .entry(property.setting.clone())
            .or_default()
            .insert(property.property.clone());
        self.entries.insert(property, result);
    }

    /// Drop every cached property of `setting`. Returns the evicted ids.
    pub fn evict_setting(&mut self, setting: &SettingRef) -> Vec<PropertyId> {
        let Some(names) = self.by_setting.remove(setting) else {
            return Vec::new();
        };
        names
            .into_iter()
            .map(|name| setting.property(name))
            .filter(|id| self.entries.remove(id).is_some())
            .collect()
    }

    /// Drop every cached property of every key of `stack`.
    pub fn evict_stack(&mut self, stack: StackId) -> Vec<PropertyId> {
        let settings: Vec<SettingRef> = self.by_setting.keys().filter(|s| s.stack == stack).cloned().collect();
        settings.iter().flat_map(|s| self.evict_setting(s)).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_setting.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cache plus dependency graph. Always mutated together under one lock so a
/// reader never sees an entry whose edges are missing.
#[derive(Debug, Default)]
pub(crate) struct ResolutionState {
    pub cache: ResolutionCache,
    pub deps: DepGraph,
}

impl ResolutionState {
    /// Evict everything that may be stale after `roots` changed. Returns the
    /// number of cached properties evicted.
    pub fn invalidate(&mut self, roots: impl IntoIterator<Item = SettingRef>) -> usize {
        let closure = self.deps.stale_closure(roots);
        let mut evicted = 0;
        for setting in &closure {
            for property in self.cache.evict_setting(setting) {
                self.deps.clear_property(&property);
                evicted += 1;
            }
        }
        tracing::debug!(settings = closure.len(), evicted, "invalidated stale closure");
        evicted
    }

    /// Evict every cached property of the given stacks, and everything that
    /// read from them.
    pub fn invalidate_stacks(&mut self, stacks: &[StackId]) -> usize {
        let mut roots: FxHashSet<SettingRef> = FxHashSet::default();
        for &stack in stacks {
            roots.extend(self.deps.referenced_in_stack(stack).cloned());
        }
        let mut evicted = self.invalidate(roots);
        for &stack in stacks {
            for property in self.cache.evict_stack(stack) {
                self.deps.clear_property(&property);
                evicted += 1;
            }
        }
        evicted
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.deps = DepGraph::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(stack: u32, key: &str, prop: &str) -> PropertyId {
        PropertyId::new(StackId(stack), key, prop)
    }

    fn sref(stack: u32, key: &str) -> SettingRef {
        SettingRef::new(StackId(stack), key)
    }

    #[test]
    fn test_evict_setting_drops_all_properties() {
        let mut cache = ResolutionCache::new();
        cache.insert(pid(0, "a", "value"), Ok(Some(Value::Int(1))));
        cache.insert(pid(0, "a", "enabled"), Ok(Some(Value::Bool(true))));
        cache.insert(pid(0, "b", "value"), Ok(None));

        let mut evicted = cache.evict_setting(&sref(0, "a"));
        evicted.sort();
        assert_eq!(evicted, vec![pid(0, "a", "enabled"), pid(0, "a", "value")]);
        assert_eq!(cache.len(), 1);
        assert!(cache.evict_setting(&sref(0, "a")).is_empty());
    }

    #[test]
    fn test_failures_are_cached_too() {
        let mut cache = ResolutionCache::new();
        cache.insert(pid(0, "a", "value"), Err(EvalError::DivisionByZero));
        assert_eq!(cache.get(&pid(0, "a", "value")), Some(&Err(EvalError::DivisionByZero)));
    }

    #[test]
    fn test_invalidate_follows_edges_transitively() {
        let mut state = ResolutionState::default();
        // c reads b, b reads a; d is unrelated
        for (key, reads) in [("b", "a"), ("c", "b")] {
            state.cache.insert(pid(0, key, "value"), Ok(Some(Value::Int(0))));
            state
                .deps
                .replace_edges(pid(0, key, "value"), [sref(0, reads)].into_iter().collect());
        }
        state.cache.insert(pid(0, "d", "value"), Ok(Some(Value::Int(0))));

        let evicted = state.invalidate([sref(0, "a")]);
        assert_eq!(evicted, 2);
        assert!(!state.cache.contains(&pid(0, "c", "value")));
        assert!(state.cache.contains(&pid(0, "d", "value")));
        assert_eq!(state.deps.tracked_count(), 0);
        state.deps.assert_consistent();
    }

    #[test]
    fn test_invalidate_stacks_reaches_other_stacks() {
        let mut state = ResolutionState::default();
        // stack 1 key x fell through to stack 0
        state.cache.insert(pid(1, "x", "value"), Ok(Some(Value::Int(0))));
        state
            .deps
            .replace_edges(pid(1, "x", "value"), [sref(0, "x")].into_iter().collect());
        state.cache.insert(pid(0, "y", "value"), Ok(Some(Value::Int(0))));

        state.invalidate_stacks(&[StackId(0)]);
        assert!(state.cache.is_empty());
        state.deps.assert_consistent();
    }
}
