//! Dependency graph for computed setting properties.
//!
//! Tracks precedents (settings a cached property read while it was computed)
//! and dependents (cached properties that read a given setting), so that a
//! write can find everything it makes stale.
//!
//! # Edge Direction
//!
//! ```text
//! A → P  means  "P read A"  (setting A is a precedent of property P)
//! ```
//!
//! Nodes are heterogeneous: precedents are whole settings (`SettingRef`,
//! any property of a key in a stack), dependents are single cached
//! properties (`PropertyId`). Edges are only ever created by an actual
//! evaluation, never by static analysis of a formula.

use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::setting_id::{PropertyId, SettingRef, StackId};

/// Persistent dependency graph for cached properties.
///
/// Maintains bidirectional adjacency for O(1) lookups:
/// - `preds[P]` = settings that P read (precedents)
/// - `succs[A]` = properties that read A (dependents)
///
/// # Invariants
///
/// 1. **Bidirectional consistency:** If A ∈ preds[P] then P ∈ succs[A], and vice versa.
/// 2. **No dangling entries:** Empty sets are removed, not stored.
/// 3. **No duplicate edges:** Set semantics enforced by FxHashSet.
/// 4. **Atomic updates:** `replace_edges` is the only mutator that touches both maps.
#[derive(Default, Debug, Clone)]
pub struct DepGraph {
    /// Precedents: for each computed property P, the settings it read.
    preds: FxHashMap<PropertyId, FxHashSet<SettingRef>>,

    /// Dependents: for each setting A, the computed properties that read it.
    succs: FxHashMap<SettingRef, FxHashSet<PropertyId>>,
}

impl DepGraph {
    /// Create an empty dependency graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the settings this property read when it was last computed.
    pub fn precedents<'a>(&'a self, property: &PropertyId) -> impl Iterator<Item = &'a SettingRef> + 'a {
        self.preds.get(property).into_iter().flat_map(|s| s.iter())
    }

    /// Returns the cached properties that read this setting.
    pub fn dependents<'a>(&'a self, setting: &SettingRef) -> impl Iterator<Item = &'a PropertyId> + 'a {
        self.succs.get(setting).into_iter().flat_map(|s| s.iter())
    }

    /// Returns true if this property has dependencies tracked in the graph.
    pub fn is_tracked(&self, property: &PropertyId) -> bool {
        self.preds.contains_key(property)
    }

    /// Number of properties with at least one precedent.
    pub fn tracked_count(&self) -> usize {
        self.preds.len()
    }

    /// Number of settings read by at least one cached property.
    pub fn referenced_count(&self) -> usize {
        self.succs.len()
    }

    /// Replace all edges for a computed property atomically.
    ///
    /// Pass an empty set to clear all edges for this property.
    pub fn replace_edges(&mut self, property: PropertyId, new_preds: FxHashSet<SettingRef>) {
        // Remove old edges
        if let Some(old_preds) = self.preds.remove(&property) {
            for pred in old_preds {
                if let Some(deps) = self.succs.get_mut(&pred) {
                    deps.remove(&property);
                    if deps.is_empty() {
                        self.succs.remove(&pred);
                    }
                }
            }
        }

        if new_preds.is_empty() {
            return;
        }

        for pred in &new_preds {
            self.succs.entry(pred.clone()).or_default().insert(property.clone());
        }
        self.preds.insert(property, new_preds);
    }

    /// Clear all edges for a property (evicted from the cache).
    pub fn clear_property(&mut self, property: &PropertyId) {
        self.replace_edges(property.clone(), FxHashSet::default());
    }

    /// Remove all edges involving a stack, as dependent or as precedent.
    ///
    /// Called when a stack is torn down.
    pub fn remove_stack(&mut self, stack: StackId) {
        let owned: Vec<PropertyId> = self.preds.keys().filter(|p| p.stack() == stack).cloned().collect();
        for property in owned {
            self.clear_property(&property);
        }

        let referenced: Vec<SettingRef> = self.succs.keys().filter(|s| s.stack == stack).cloned().collect();
        for setting in referenced {
            if let Some(dependents) = self.succs.remove(&setting) {
                for dep in dependents {
                    if let Some(preds) = self.preds.get_mut(&dep) {
                        preds.remove(&setting);
                        if preds.is_empty() {
                            self.preds.remove(&dep);
                        }
                    }
                }
            }
        }
    }

    /// Settings referenced by any tracked property, restricted to one stack.
    pub fn referenced_in_stack(&self, stack: StackId) -> impl Iterator<Item = &SettingRef> + '_ {
        self.succs.keys().filter(move |s| s.stack == stack)
    }

    /// Transitive closure over dependent edges.
    ///
    /// Starting from `roots`, returns every setting whose cached properties
    /// may be stale: the roots themselves plus, transitively, the setting of
    /// every property that read one of them. BFS order, each setting once.
    pub fn stale_closure(&self, roots: impl IntoIterator<Item = SettingRef>) -> Vec<SettingRef> {
        let mut visited: FxHashSet<SettingRef> = FxHashSet::default();
        let mut order = Vec::new();
        let mut queue: VecDeque<SettingRef> = VecDeque::new();

        for root in roots {
            if visited.insert(root.clone()) {
                queue.push_back(root);
            }
        }

        while let Some(setting) = queue.pop_front() {
            for dep in self.dependents(&setting) {
                if visited.insert(dep.setting.clone()) {
                    queue.push_back(dep.setting.clone());
                }
            }
            order.push(setting);
        }

        order
    }

    /// Check all invariants. Panics if any are violated.
    ///
    /// Only available in test builds.
    #[cfg(test)]
    pub fn assert_consistent(&self) {
        for (property, preds) in &self.preds {
            for pred in preds {
                assert!(
                    self.succs.get(pred).map_or(false, |s| s.contains(property)),
                    "Missing succ edge: {} should have {} in dependents",
                    pred,
                    property
                );
            }
        }

        for (setting, dependents) in &self.succs {
            for dep in dependents {
                assert!(
                    self.preds.get(dep).map_or(false, |s| s.contains(setting)),
                    "Missing pred edge: {} should have {} in precedents",
                    dep,
                    setting
                );
            }
        }

        for (property, preds) in &self.preds {
            assert!(!preds.is_empty(), "Empty preds set stored for {}", property);
        }
        for (setting, succs) in &self.succs {
            assert!(!succs.is_empty(), "Empty succs set stored for {}", setting);
        }
    }
}
