//! Container stacks and the per-machine stack graph.
//!
//! A [`ContainerStack`] is a definition tree plus its layers in fixed
//! priority order:
//!
//! ```text
//! user > quality_changes > intent > quality > material > variant > definition_changes > definition
//! ```
//!
//! The stacks of every machine live in one arena ([`StackGraph`]) addressed
//! by [`StackId`]. Links between them (global -> extruders, object ->
//! extruder, `next_stack`) are ids, never references.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::container::{
    ContainerType, InstanceContainer, PresetLayer, PropertyValue, SharedContainer, WritableContainer, WritableLayer,
};
use crate::definition::DefinitionTree;
use crate::error::StackError;
use crate::setting_id::StackId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackKind {
    Global,
    Extruder { position: usize },
    /// Per-object override stack for one scene object.
    Object { name: String },
}

impl StackKind {
    pub fn tag(&self) -> &'static str {
        match self {
            StackKind::Global => "global",
            StackKind::Extruder { .. } => "extruder",
            StackKind::Object { .. } => "object",
        }
    }
}

/// Which layer supplied a raw property value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerSource {
    Container {
        stack: StackId,
        container_id: String,
        container_type: ContainerType,
    },
    Definition {
        family: String,
    },
}

#[derive(Debug, Clone)]
pub struct ContainerStack {
    id: StackId,
    name: String,
    kind: StackKind,
    definition: Arc<DefinitionTree>,
    user: Option<WritableContainer>,
    definition_changes: Option<WritableContainer>,
    presets: [Option<SharedContainer>; 5],
    next_stack: Option<StackId>,
    /// Only meaningful for extruder stacks.
    enabled: bool,
}

impl ContainerStack {
    fn new(id: StackId, name: String, kind: StackKind, definition: Arc<DefinitionTree>) -> Self {
        Self {
            id,
            name,
            kind,
            definition,
            user: None,
            definition_changes: None,
            presets: Default::default(),
            next_stack: None,
            enabled: true,
        }
    }

    pub fn id(&self) -> StackId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &StackKind {
        &self.kind
    }

    pub fn is_global(&self) -> bool {
        self.kind == StackKind::Global
    }

    pub fn extruder_position(&self) -> Option<usize> {
        match self.kind {
            StackKind::Extruder { position } => Some(position),
            _ => None,
        }
    }

    pub fn definition(&self) -> &Arc<DefinitionTree> {
        &self.definition
    }

    pub fn next_stack(&self) -> Option<StackId> {
        self.next_stack
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn user(&self) -> Option<&WritableContainer> {
        self.user.as_ref()
    }

    pub fn definition_changes(&self) -> Option<&WritableContainer> {
        self.definition_changes.as_ref()
    }

    pub fn preset(&self, layer: PresetLayer) -> Option<&SharedContainer> {
        self.presets[layer.index()].as_ref()
    }

    /// Present layers, highest priority first. The definition is not included.
    pub fn layers(&self) -> impl Iterator<Item = &InstanceContainer> + '_ {
        let user = self.user.as_deref();
        let presets = self.presets.iter().filter_map(|p| p.as_deref());
        let definition_changes = self.definition_changes.as_deref();
        user.into_iter().chain(presets).chain(definition_changes)
    }

    /// First layer of this stack (not its `next_stack`) holding `property` for `key`.
    pub fn raw_property(&self, key: &str, property: &str) -> Option<(&InstanceContainer, &PropertyValue)> {
        self.layers()
            .find_map(|layer| layer.property(key, property).map(|value| (layer, value)))
    }

    /// True if `key` has an explicit `value` in one of `types`.
    pub fn has_value_in(&self, key: &str, types: &[ContainerType]) -> bool {
        self.layers()
            .filter(|layer| types.contains(&layer.container_type()))
            .any(|layer| layer.has_property(key, "value"))
    }

    /// The writable layer, created empty on first use.
    pub(crate) fn writable_mut(&mut self, layer: WritableLayer) -> &mut WritableContainer {
        let (slot, suffix) = match layer {
            WritableLayer::User => (&mut self.user, "user"),
            WritableLayer::DefinitionChanges => (&mut self.definition_changes, "settings"),
        };
        let name = &self.name;
        slot.get_or_insert_with(|| WritableContainer::new(format!("{}_{}", name, suffix), layer))
    }

    pub(crate) fn writable_existing_mut(&mut self, layer: WritableLayer) -> Option<&mut WritableContainer> {
        match layer {
            WritableLayer::User => self.user.as_mut(),
            WritableLayer::DefinitionChanges => self.definition_changes.as_mut(),
        }
    }

    pub(crate) fn replace_writable(&mut self, container: WritableContainer) -> Option<WritableContainer> {
        let slot = match container.container_type() {
            ContainerType::User => &mut self.user,
            _ => &mut self.definition_changes,
        };
        slot.replace(container)
    }

    pub(crate) fn set_preset(&mut self, layer: PresetLayer, container: Option<SharedContainer>) -> Option<SharedContainer> {
        std::mem::replace(&mut self.presets[layer.index()], container)
    }

    pub(crate) fn set_next_stack(&mut self, next: Option<StackId>) {
        self.next_stack = next;
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }
}

/// The stack an edit or read is aimed at before routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    Global,
    Extruder(i64),
    Object(StackId),
}

#[derive(Debug, Clone, Default)]
struct MachineLinks {
    extruders: Vec<StackId>,
    objects: Vec<StackId>,
}

/// Arena of every stack, plus the global -> extruder/object links.
#[derive(Debug, Clone, Default)]
pub struct StackGraph {
    stacks: Vec<Option<ContainerStack>>,
    machines: FxHashMap<StackId, MachineLinks>,
    /// Extruder or object stack -> its machine's global stack.
    owners: FxHashMap<StackId, StackId>,
}

impl StackGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> StackId {
        StackId(self.stacks.len() as u32)
    }

    fn push(&mut self, stack: ContainerStack) -> StackId {
        let id = stack.id;
        self.stacks.push(Some(stack));
        id
    }

    pub fn add_global(&mut self, name: &str, definition: Arc<DefinitionTree>) -> StackId {
        let id = self.push(ContainerStack::new(self.next_id(), name.to_string(), StackKind::Global, definition));
        self.machines.insert(id, MachineLinks::default());
        id
    }

    /// Append an extruder at the next free position. Its `next_stack` is the global stack.
    pub fn add_extruder(&mut self, global: StackId, name: &str) -> Result<StackId, StackError> {
        let definition = self.global(global)?.definition.clone();
        let position = self.links(global)?.extruders.len();
        let mut stack = ContainerStack::new(
            self.next_id(),
            name.to_string(),
            StackKind::Extruder { position },
            definition,
        );
        stack.set_next_stack(Some(global));
        let id = self.push(stack);
        self.links_mut(global)?.extruders.push(id);
        self.owners.insert(id, global);
        Ok(id)
    }

    /// Add a per-object stack falling through to the extruder at `position`.
    pub fn add_object(&mut self, global: StackId, name: &str, position: i64) -> Result<StackId, StackError> {
        let extruder = self.extruder_stack(global, position)?;
        let definition = self.global(global)?.definition.clone();
        let mut stack = ContainerStack::new(
            self.next_id(),
            name.to_string(),
            StackKind::Object { name: name.to_string() },
            definition,
        );
        stack.set_next_stack(Some(extruder));
        let id = self.push(stack);
        self.links_mut(global)?.objects.push(id);
        self.owners.insert(id, global);
        Ok(id)
    }

    /// Tear down an object stack. Its id is not reused.
    pub fn remove_object(&mut self, object: StackId) -> Result<ContainerStack, StackError> {
        self.object_owner(object)?;
        let global = self.global_of(object)?;
        self.links_mut(global)?.objects.retain(|o| *o != object);
        self.owners.remove(&object);
        self.stacks
            .get_mut(object.index())
            .and_then(Option::take)
            .ok_or(StackError::UnknownStack(object))
    }

    pub fn get(&self, id: StackId) -> Result<&ContainerStack, StackError> {
        self.stacks
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(StackError::UnknownStack(id))
    }

    pub(crate) fn get_mut(&mut self, id: StackId) -> Result<&mut ContainerStack, StackError> {
        self.stacks
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(StackError::UnknownStack(id))
    }

    pub fn contains(&self, id: StackId) -> bool {
        self.get(id).is_ok()
    }

    /// Every live stack id, in creation order.
    pub fn ids(&self) -> impl Iterator<Item = StackId> + '_ {
        self.stacks.iter().flatten().map(|s| s.id)
    }

    pub fn globals(&self) -> Vec<StackId> {
        let mut ids: Vec<StackId> = self.machines.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn global(&self, id: StackId) -> Result<&ContainerStack, StackError> {
        let stack = self.get(id)?;
        if !stack.is_global() {
            return Err(StackError::InvalidStackKind { stack: id, expected: "global" });
        }
        Ok(stack)
    }

    fn links(&self, global: StackId) -> Result<&MachineLinks, StackError> {
        self.global(global)?;
        self.machines.get(&global).ok_or(StackError::UnknownStack(global))
    }

    fn links_mut(&mut self, global: StackId) -> Result<&mut MachineLinks, StackError> {
        self.global(global)?;
        self.machines.get_mut(&global).ok_or(StackError::UnknownStack(global))
    }

    fn object_owner(&self, object: StackId) -> Result<StackId, StackError> {
        match self.get(object)?.kind {
            StackKind::Object { .. } => self.global_of(object),
            _ => Err(StackError::InvalidStackKind { stack: object, expected: "object" }),
        }
    }

    /// The global stack of the machine `id` belongs to (itself for a global stack).
    pub fn global_of(&self, id: StackId) -> Result<StackId, StackError> {
        let stack = self.get(id)?;
        if stack.is_global() {
            return Ok(id);
        }
        self.owners.get(&id).copied().ok_or(StackError::UnknownStack(id))
    }

    pub fn extruders(&self, global: StackId) -> Result<&[StackId], StackError> {
        Ok(&self.links(global)?.extruders)
    }

    pub fn objects(&self, global: StackId) -> Result<&[StackId], StackError> {
        Ok(&self.links(global)?.objects)
    }

    /// Extruder stack at `index` of the machine.
    pub fn extruder_stack(&self, global: StackId, index: i64) -> Result<StackId, StackError> {
        let extruders = self.extruders(global)?;
        usize::try_from(index)
            .ok()
            .and_then(|i| extruders.get(i).copied())
            .ok_or(StackError::ExtruderIndexOutOfRange {
                index,
                count: extruders.len(),
            })
    }

    /// `(position, stack)` of each enabled extruder, in position order.
    pub fn enabled_extruders(&self, global: StackId) -> Result<Vec<(usize, StackId)>, StackError> {
        let mut enabled = Vec::new();
        for (position, id) in self.extruders(global)?.iter().enumerate() {
            if self.get(*id)?.enabled {
                enabled.push((position, *id));
            }
        }
        Ok(enabled)
    }

    /// Global stack, then extruders, then objects.
    pub fn machine_stacks(&self, global: StackId) -> Result<Vec<StackId>, StackError> {
        let links = self.links(global)?;
        let mut ids = Vec::with_capacity(1 + links.extruders.len() + links.objects.len());
        ids.push(global);
        ids.extend(&links.extruders);
        ids.extend(&links.objects);
        Ok(ids)
    }

    pub(crate) fn set_extruder_enabled(&mut self, global: StackId, index: i64, enabled: bool) -> Result<StackId, StackError> {
        let id = self.extruder_stack(global, index)?;
        self.get_mut(id)?.set_enabled(enabled);
        Ok(id)
    }

    /// Point an object stack at a different extruder.
    pub(crate) fn rebind_object(&mut self, object: StackId, position: i64) -> Result<StackId, StackError> {
        let global = self.object_owner(object)?;
        let extruder = self.extruder_stack(global, position)?;
        self.get_mut(object)?.set_next_stack(Some(extruder));
        Ok(extruder)
    }

    /// The concrete stack a read or edit of `key` lands on.
    ///
    /// Per-mesh keys stay on a targeted object; per-extruder keys land on the
    /// targeted extruder (an object's bound extruder included); everything
    /// else goes to the global stack.
    pub fn route(&self, global: StackId, key: &str, target: RouteTarget) -> Result<StackId, StackError> {
        let definition = self
            .global(global)?
            .definition
            .get(key)
            .ok_or_else(|| StackError::UnknownSetting {
                key: key.to_string(),
                stack: global,
            })?;

        match target {
            RouteTarget::Global => Ok(global),
            RouteTarget::Extruder(index) => {
                let extruder = self.extruder_stack(global, index)?;
                Ok(if definition.settable_per_extruder { extruder } else { global })
            }
            RouteTarget::Object(object) => {
                if self.object_owner(object)? != global {
                    return Err(StackError::InvalidStackKind {
                        stack: object,
                        expected: "object of this machine",
                    });
                }
                if definition.settable_per_mesh {
                    return Ok(object);
                }
                match self.get(object)?.next_stack {
                    Some(extruder) if definition.settable_per_extruder => Ok(extruder),
                    _ => Ok(global),
                }
            }
        }
    }
}
