//! Setting identity for the dependency graph and resolution cache.
//!
//! A `SettingRef` names one setting key within one container stack; a
//! `PropertyId` narrows that to a single property (`value`, `enabled`, ...).
//! Stacks are addressed by arena index, never by pointer.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Stable identifier of a container stack (index into the stack arena).
///
/// Ids are never reused after a stack is removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StackId(pub(crate) u32);

impl StackId {
    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for StackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One setting key as seen through one stack. Graph node for invalidation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SettingRef {
    pub stack: StackId,
    pub key: Arc<str>,
}

impl SettingRef {
    #[inline]
    pub fn new(stack: StackId, key: impl Into<Arc<str>>) -> Self {
        Self { stack, key: key.into() }
    }

    pub fn property(&self, property: impl Into<Arc<str>>) -> PropertyId {
        PropertyId {
            setting: self.clone(),
            property: property.into(),
        }
    }
}

impl std::fmt::Display for SettingRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.stack, self.key)
    }
}

/// A single cached property: `(stack, key, property_name)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyId {
    pub setting: SettingRef,
    pub property: Arc<str>,
}

impl PropertyId {
    pub fn new(stack: StackId, key: &str, property: &str) -> Self {
        Self {
            setting: SettingRef::new(stack, key),
            property: property.into(),
        }
    }

    #[inline]
    pub fn stack(&self) -> StackId {
        self.setting.stack
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.setting.key
    }
}

impl std::fmt::Display for PropertyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.setting, self.property)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_property_id_equality() {
        let a = PropertyId::new(StackId(1), "layer_height", "value");
        let b = PropertyId::new(StackId(1), "layer_height", "value");
        let c = PropertyId::new(StackId(2), "layer_height", "value");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_property_id_hash() {
        let mut set = HashSet::new();
        set.insert(PropertyId::new(StackId(1), "a", "value"));
        set.insert(PropertyId::new(StackId(1), "a", "value")); // duplicate
        set.insert(PropertyId::new(StackId(1), "a", "enabled"));

        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_display() {
        let id = PropertyId::new(StackId(3), "wall_thickness", "value");
        assert_eq!(id.to_string(), "#3:wall_thickness.value");
        assert_eq!(id.setting.to_string(), "#3:wall_thickness");
    }
}
