//! Definition store: registered raw records in, merged and cached
//! [`DefinitionTree`]s out.
//!
//! # Merge
//!
//! `load(family)` first loads the family's parent (recursively), copies the
//! parent's draft tree, and then applies the child's `settings` tree and its
//! `overrides`. For a key the parent already has, only the fields the child
//! names are replaced. A new key is inserted after the sibling the child
//! declared before it (or appended when it is the first at its level).

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};

use super::raw::{split_node, JsonMap, RawDefinition};
use super::{DefinitionTree, SettingDefinition};
use crate::error::DefinitionError;

/// Mutable tree used while merging an inherits chain.
#[derive(Debug, Clone, Default)]
struct Draft {
    roots: Vec<String>,
    nodes: FxHashMap<String, DraftNode>,
}

#[derive(Debug, Clone)]
struct DraftNode {
    fields: JsonMap,
    parent: Option<String>,
    children: Vec<String>,
}

/// A loaded family keeps its draft so children can merge onto a copy.
#[derive(Debug)]
struct LoadedFamily {
    draft: Draft,
    tree: Arc<DefinitionTree>,
}

#[derive(Debug, Default)]
pub struct DefinitionStore {
    records: FxHashMap<String, RawDefinition>,
    loaded: RwLock<FxHashMap<String, Arc<LoadedFamily>>>,
}

impl DefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw definition. Ids are unique for the store's lifetime.
    pub fn register(&mut self, raw: RawDefinition) -> Result<(), DefinitionError> {
        if self.records.contains_key(&raw.id) {
            return Err(DefinitionError::malformed(&raw.id, "definition id registered twice"));
        }
        tracing::debug!(family = %raw.id, inherits = ?raw.inherits, "registered definition");
        self.records.insert(raw.id.clone(), raw);
        Ok(())
    }

    /// Parse and register a JSON definition record. Returns its id.
    pub fn register_json(&mut self, text: &str) -> Result<String, DefinitionError> {
        let raw = RawDefinition::from_json_str(text)?;
        let id = raw.id.clone();
        self.register(raw)?;
        Ok(id)
    }

    pub fn contains(&self, family: &str) -> bool {
        self.records.contains_key(family)
    }

    /// Registered ids, sorted.
    pub fn families(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.records.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Merged tree for `family`, built on first request and cached.
    pub fn load(&self, family: &str) -> Result<Arc<DefinitionTree>, DefinitionError> {
        let mut visiting = Vec::new();
        self.load_family(family, &mut visiting).map(|f| f.tree.clone())
    }

    /// Number of families built so far.
    pub fn loaded_count(&self) -> usize {
        self.loaded.read().len()
    }

    fn load_family(&self, family: &str, visiting: &mut Vec<String>) -> Result<Arc<LoadedFamily>, DefinitionError> {
        if let Some(done) = self.loaded.read().get(family) {
            return Ok(done.clone());
        }

        if let Some(pos) = visiting.iter().position(|f| f == family) {
            let mut chain = visiting[pos..].to_vec();
            chain.push(family.to_string());
            return Err(DefinitionError::DefinitionCycle(chain));
        }

        let raw = self
            .records
            .get(family)
            .ok_or_else(|| DefinitionError::DefinitionNotFound(family.to_string()))?;

        visiting.push(family.to_string());
        let (mut draft, mut chain, mut metadata) = match &raw.inherits {
            Some(parent) => {
                let parent = self.load_family(parent, visiting)?;
                (parent.draft.clone(), parent.tree.chain.clone(), parent.tree.metadata.clone())
            }
            None => (Draft::default(), Vec::new(), JsonMap::new()),
        };
        visiting.pop();
        chain.push(family.to_string());

        let mut declared = FxHashSet::default();
        apply_settings(&mut draft, family, None, &raw.settings, &mut declared)?;
        apply_overrides(&mut draft, family, &raw.overrides)?;

        for (k, v) in &raw.metadata {
            metadata.insert(k.clone(), v.clone());
        }

        let tree = build_tree(&draft, family, &raw.name, metadata, chain)?;
        tracing::debug!(family, settings = tree.len(), chain = ?tree.chain, "built definition tree");

        let loaded = Arc::new(LoadedFamily {
            draft,
            tree: Arc::new(tree),
        });
        self.loaded
            .write()
            .entry(family.to_string())
            .or_insert_with(|| loaded.clone());
        Ok(loaded)
    }
}

fn apply_settings(
    draft: &mut Draft,
    family: &str,
    parent: Option<&str>,
    tree: &JsonMap,
    declared: &mut FxHashSet<String>,
) -> Result<(), DefinitionError> {
    let mut previous: Option<&str> = None;

    for (key, node) in tree {
        if !declared.insert(key.clone()) {
            return Err(DefinitionError::malformed(family, format!("duplicate setting key '{}'", key)));
        }
        let (fields, children) = split_node(family, key, node)?;

        if let Some(existing) = draft.nodes.get_mut(key) {
            // Inherited key: replace only the named fields, keep position
            for (name, value) in fields {
                existing.fields.insert(name, value);
            }
        } else {
            let siblings = match parent {
                Some(p) => match draft.nodes.get_mut(p) {
                    Some(node) => &mut node.children,
                    None => return Err(DefinitionError::malformed(family, format!("parent '{}' missing", p))),
                },
                None => &mut draft.roots,
            };
            let at = previous
                .and_then(|prev| siblings.iter().position(|s| s == prev))
                .map(|i| i + 1)
                .unwrap_or(siblings.len());
            siblings.insert(at, key.clone());
            draft.nodes.insert(
                key.clone(),
                DraftNode {
                    fields,
                    parent: parent.map(String::from),
                    children: Vec::new(),
                },
            );
        }

        if let Some(children) = children {
            apply_settings(draft, family, Some(key), children, declared)?;
        }
        previous = Some(key);
    }

    Ok(())
}

fn apply_overrides(draft: &mut Draft, family: &str, overrides: &JsonMap) -> Result<(), DefinitionError> {
    for (key, node) in overrides {
        let (fields, children) = split_node(family, key, node)?;
        if children.is_some() {
            return Err(DefinitionError::malformed(
                family,
                format!("override of '{}' cannot declare children", key),
            ));
        }
        let Some(existing) = draft.nodes.get_mut(key) else {
            return Err(DefinitionError::malformed(
                family,
                format!("override of unknown setting '{}'", key),
            ));
        };
        for (name, value) in fields {
            existing.fields.insert(name, value);
        }
    }
    Ok(())
}

fn build_tree(
    draft: &Draft,
    family: &str,
    name: &str,
    metadata: JsonMap,
    chain: Vec<String>,
) -> Result<DefinitionTree, DefinitionError> {
    let mut order = Vec::with_capacity(draft.nodes.len());
    let mut settings = FxHashMap::default();

    // Depth-first, iterative; children pushed in reverse to pop in order
    let mut pending: Vec<(&str, usize)> = draft.roots.iter().rev().map(|k| (k.as_str(), 0)).collect();
    while let Some((key, depth)) = pending.pop() {
        let Some(node) = draft.nodes.get(key) else {
            return Err(DefinitionError::malformed(family, format!("dangling child '{}'", key)));
        };
        let definition = SettingDefinition::from_fields(
            family,
            key,
            &node.fields,
            node.parent.clone(),
            node.children.clone(),
            depth,
        )?;
        order.push(key.to_string());
        settings.insert(key.to_string(), definition);
        pending.extend(node.children.iter().rev().map(|k| (k.as_str(), depth + 1)));
    }

    Ok(DefinitionTree {
        family: family.to_string(),
        name: if name.is_empty() { family.to_string() } else { name.to_string() },
        metadata,
        chain,
        roots: draft.roots.clone(),
        order,
        settings,
    })
}
