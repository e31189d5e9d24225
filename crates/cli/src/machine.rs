//! machine.json loading: definitions, profiles, and the stacks they form.
//!
//! ```json
//! {
//!   "definitions": "definitions",
//!   "family": "strata_test_printer",
//!   "name": "bench printer",
//!   "containers": ["profiles/normal.inst.json", "user_global.json"],
//!   "extruders": [
//!     {"name": "left", "containers": ["materials/pla.inst.json"]},
//!     {"name": "right", "enabled": false}
//!   ]
//! }
//! ```
//!
//! Paths are relative to the machine file. Every `*.def.json` file in the
//! definitions directory is registered. Each container file is a profile
//! record; its `type` picks the layer it is installed into.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use strata_engine::{
    ContainerRecord, DefinitionError, EngineConfig, EvalError, InstanceContainer, PresetLayer, SettingsEngine,
    StackError, StackId, WritableContainer,
};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path}: {source}")]
    Definition {
        path: PathBuf,
        #[source]
        source: DefinitionError,
    },

    #[error("{path}: {source}")]
    Profile {
        path: PathBuf,
        #[source]
        source: EvalError,
    },

    #[error("{0}")]
    Machine(String),

    #[error(transparent)]
    Stack(#[from] StackError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MachineFile {
    pub definitions: PathBuf,
    pub family: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Profile files of the global stack.
    #[serde(default)]
    pub containers: Vec<PathBuf>,
    #[serde(default)]
    pub extruders: Vec<ExtruderFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtruderFile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub containers: Vec<PathBuf>,
}

fn enabled_by_default() -> bool {
    true
}

/// An engine with one machine assembled from a machine file.
pub struct LoadedMachine {
    pub engine: SettingsEngine,
    pub global: StackId,
    pub extruders: Vec<StackId>,
}

impl LoadedMachine {
    /// Global stack, or extruder `index` when given.
    pub fn stack(&self, extruder: Option<i64>) -> Result<StackId, StackError> {
        match extruder {
            None => Ok(self.global),
            Some(index) => self.engine.extruder_stack(self.global, index),
        }
    }

    /// Global stack first, then each extruder, with display names.
    pub fn stacks(&self) -> Vec<(StackId, String)> {
        std::iter::once(self.global)
            .chain(self.extruders.iter().copied())
            .filter_map(|id| {
                let stack = self.engine.stack(id).ok()?;
                Some((id, stack.name().to_string()))
            })
            .collect()
    }
}

pub fn load(path: &Path, config: EngineConfig) -> Result<LoadedMachine, LoadError> {
    let machine: MachineFile = read_json(path)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    let mut engine = SettingsEngine::new(config);
    let definitions_dir = base.join(&machine.definitions);
    let registered = register_definitions(&mut engine, &definitions_dir)?;
    tracing::debug!(dir = %definitions_dir.display(), registered, "definitions registered");

    if !engine.definitions().contains(&machine.family) {
        return Err(LoadError::Machine(format!(
            "family '{}' not found in {}",
            machine.family,
            definitions_dir.display()
        )));
    }
    let name = machine.name.clone().unwrap_or_else(|| machine.family.clone());
    let global = engine.create_machine(&machine.family, &name)?;
    install_containers(&mut engine, global, base, &machine.containers)?;

    let mut extruders = Vec::with_capacity(machine.extruders.len());
    for (index, extruder) in machine.extruders.iter().enumerate() {
        let name = extruder
            .name
            .clone()
            .unwrap_or_else(|| format!("extruder_{}", index));
        let id = engine.add_extruder(global, &name)?;
        install_containers(&mut engine, id, base, &extruder.containers)?;
        if !extruder.enabled {
            engine.set_extruder_enabled(global, index as i64, false)?;
        }
        extruders.push(id);
    }

    tracing::info!(family = %machine.family, extruders = extruders.len(), "machine loaded");
    Ok(LoadedMachine {
        engine,
        global,
        extruders,
    })
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, LoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| LoadError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn register_definitions(engine: &mut SettingsEngine, dir: &Path) -> Result<usize, LoadError> {
    let entries = std::fs::read_dir(dir).map_err(|source| LoadError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.to_str().is_some_and(|s| s.ends_with(".def.json")))
        .collect();
    files.sort();

    for file in &files {
        let text = std::fs::read_to_string(file).map_err(|source| LoadError::Io {
            path: file.clone(),
            source,
        })?;
        engine
            .register_definition_json(&text)
            .map_err(|source| LoadError::Definition {
                path: file.clone(),
                source,
            })?;
    }
    Ok(files.len())
}

fn install_containers(
    engine: &mut SettingsEngine,
    stack: StackId,
    base: &Path,
    files: &[PathBuf],
) -> Result<(), LoadError> {
    for file in files {
        let path = base.join(file);
        let record: ContainerRecord = read_json(&path)?;
        let container = InstanceContainer::from_record(&record).map_err(|source| LoadError::Profile {
            path: path.clone(),
            source,
        })?;
        let container_type = container.container_type();
        match PresetLayer::from_container_type(container_type) {
            Some(layer) => {
                if engine.set_preset(stack, layer, Some(container.into_shared()))?.is_some() {
                    return Err(LoadError::Machine(format!(
                        "{}: second {} container for the same stack",
                        path.display(),
                        container_type
                    )));
                }
            }
            None => {
                let writable = WritableContainer::from_container(container)
                    .map_err(|c| LoadError::Machine(format!("{}: cannot install a {} container", path.display(), c.container_type())))?;
                if engine.set_writable_layer(stack, writable)?.is_some() {
                    return Err(LoadError::Machine(format!(
                        "{}: second {} container for the same stack",
                        path.display(),
                        container_type
                    )));
                }
            }
        }
        tracing::debug!(stack = %stack, path = %path.display(), layer = %container_type, "container installed");
    }
    Ok(())
}
