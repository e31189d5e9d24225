pub mod cache;
pub mod config;
pub mod container;
pub mod definition;
pub mod dep_graph;
pub mod engine;
pub mod error;
pub mod events;
pub mod expr;
mod resolver;
pub mod setting_id;
pub mod snapshot;
pub mod stack;
pub mod validation;
pub mod value;

#[cfg(test)]
pub mod harness;

pub use config::{ConfigError, EngineConfig};
pub use container::{
    ContainerRecord, ContainerType, InstanceContainer, PresetLayer, PropertyValue, SharedContainer,
    WritableContainer, WritableLayer,
};
pub use definition::{DefinitionStore, DefinitionTree, RawDefinition, SettingDefinition};
pub use engine::{Explanation, SettingsEngine};
pub use error::{DefinitionError, EvalError, StackError};
pub use events::{ChangeEvent, EventCollector, RewireReason};
pub use resolver::Redirect;
pub use setting_id::{PropertyId, SettingRef, StackId};
pub use snapshot::Snapshot;
pub use stack::{ContainerStack, LayerSource, RouteTarget, StackGraph, StackKind};
pub use validation::ValidationState;
pub use value::{IntCoercion, SettingType, Value};
