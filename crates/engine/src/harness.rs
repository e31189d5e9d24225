//! Test fixture: a small printer family and a two-extruder machine.
//!
//! `strata_base` carries a trimmed fdmprinter-style tree; `FAMILY` inherits
//! it and overrides the machine height. Defaults worth remembering:
//!
//! - `layer_height` 0.1, `layer_height_0 = layer_height * 2`
//! - `machine_nozzle_size` 0.4, `line_width = machine_nozzle_size`
//! - `wall_thickness = line_width * 2`, `wall_line_count = wall_thickness / line_width`
//! - `speed_print` 60, `speed_travel = speed_print * 2`
//! - `material_bed_temperature` 60, resolved as the max over extruders
//! - `support_speed` limited to `support_extruder_nr` (0)

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use crate::config::EngineConfig;
use crate::engine::SettingsEngine;
use crate::events::{collect_into, EventCollector};
use crate::setting_id::StackId;

pub const BASE_FAMILY: &str = "strata_base";
pub const FAMILY: &str = "strata_test_printer";

pub fn base_definition() -> serde_json::Value {
    json!({
        "id": BASE_FAMILY,
        "name": "Strata Base Printer",
        "metadata": {"type": "machine", "visible": false},
        "settings": {
            "machine_settings": {
                "label": "Machine",
                "type": "category",
                "children": {
                    "machine_height": {
                        "label": "Machine Height",
                        "type": "float",
                        "unit": "mm",
                        "default_value": 200.0,
                        "minimum_value": "1",
                        "settable_per_extruder": false,
                        "settable_per_mesh": false
                    },
                    "machine_nozzle_size": {
                        "label": "Nozzle Diameter",
                        "type": "float",
                        "unit": "mm",
                        "default_value": 0.4,
                        "minimum_value": "0.001",
                        "settable_per_mesh": false
                    }
                }
            },
            "resolution": {
                "label": "Quality",
                "type": "category",
                "children": {
                    "layer_height": {
                        "label": "Layer Height",
                        "type": "float",
                        "unit": "mm",
                        "default_value": 0.1,
                        "minimum_value": "0.001",
                        "maximum_value": "machine_nozzle_size",
                        "maximum_value_warning": "0.8 * machine_nozzle_size",
                        "settable_per_extruder": false,
                        "settable_per_mesh": false
                    },
                    "layer_height_0": {
                        "label": "Initial Layer Height",
                        "type": "float",
                        "unit": "mm",
                        "default_value": 0.3,
                        "value": "layer_height * 2",
                        "settable_per_extruder": false,
                        "settable_per_mesh": false
                    },
                    "line_width": {
                        "label": "Line Width",
                        "type": "float",
                        "unit": "mm",
                        "default_value": 0.4,
                        "value": "machine_nozzle_size",
                        "settable_per_mesh": false
                    }
                }
            },
            "shell": {
                "label": "Walls",
                "type": "category",
                "children": {
                    "wall_thickness": {
                        "label": "Wall Thickness",
                        "type": "float",
                        "unit": "mm",
                        "default_value": 0.8,
                        "value": "line_width * 2",
                        "minimum_value": "0"
                    },
                    "wall_line_count": {
                        "label": "Wall Line Count",
                        "type": "int",
                        "default_value": 2,
                        "value": "wall_thickness / line_width",
                        "minimum_value": "0"
                    }
                }
            },
            "material": {
                "label": "Material",
                "type": "category",
                "children": {
                    "material_print_temperature": {
                        "label": "Printing Temperature",
                        "type": "float",
                        "unit": "°C",
                        "default_value": 200.0,
                        "settable_per_mesh": false
                    },
                    "material_bed_temperature": {
                        "label": "Build Plate Temperature",
                        "type": "float",
                        "unit": "°C",
                        "default_value": 60.0,
                        "resolve": "max(extruderValues('material_bed_temperature'))",
                        "settable_per_mesh": false
                    },
                    "has_abrasive_material": {
                        "label": "Abrasive Material Loaded",
                        "type": "bool",
                        "default_value": false,
                        "value": "anyExtruderWithMaterial('abrasive')",
                        "settable_per_extruder": false,
                        "settable_per_mesh": false
                    }
                }
            },
            "speed": {
                "label": "Speed",
                "type": "category",
                "children": {
                    "speed_print": {
                        "label": "Print Speed",
                        "type": "float",
                        "unit": "mm/s",
                        "default_value": 60.0,
                        "minimum_value": "0.1"
                    },
                    "speed_travel": {
                        "label": "Travel Speed",
                        "type": "float",
                        "unit": "mm/s",
                        "default_value": 120.0,
                        "value": "speed_print * 2"
                    },
                    "support_speed": {
                        "label": "Support Speed",
                        "type": "float",
                        "unit": "mm/s",
                        "default_value": 60.0,
                        "value": "speed_print",
                        "enabled": "support_enable",
                        "limit_to_extruder": "support_extruder_nr",
                        "settable_per_mesh": false
                    }
                }
            },
            "support": {
                "label": "Support",
                "type": "category",
                "children": {
                    "support_enable": {
                        "label": "Generate Support",
                        "type": "bool",
                        "default_value": false,
                        "settable_per_extruder": false
                    },
                    "support_extruder_nr": {
                        "label": "Support Extruder",
                        "type": "extruder",
                        "default_value": 0,
                        "settable_per_extruder": false,
                        "settable_per_mesh": false
                    }
                }
            },
            "platform_adhesion": {
                "label": "Build Plate Adhesion",
                "type": "category",
                "children": {
                    "adhesion_type": {
                        "label": "Build Plate Adhesion Type",
                        "type": "enum",
                        "options": {"skirt": "Skirt", "brim": "Brim", "raft": "Raft", "none": "None"},
                        "default_value": "brim",
                        "settable_per_extruder": false,
                        "settable_per_mesh": false
                    }
                }
            }
        }
    })
}

pub fn printer_definition() -> serde_json::Value {
    json!({
        "id": FAMILY,
        "name": "Strata Test Printer",
        "inherits": BASE_FAMILY,
        "metadata": {"visible": true, "manufacturer": "Strata"},
        "overrides": {
            "machine_height": {"default_value": 180.0}
        }
    })
}

/// Engine with both families registered and one machine built.
pub struct Fixture {
    pub engine: SettingsEngine,
    pub global: StackId,
    pub extruders: Vec<StackId>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let mut engine = SettingsEngine::new(config);
        for definition in [base_definition(), printer_definition()] {
            engine
                .register_definition_json(&definition.to_string())
                .expect("fixture definition registers");
        }
        let global = engine.create_machine(FAMILY, "test_printer").expect("machine");
        let extruders = (0..2)
            .map(|i| engine.add_extruder(global, &format!("extruder_{}", i)).expect("extruder"))
            .collect();
        Self { engine, global, extruders }
    }

    /// Subscribe a collector to every event emitted from now on.
    pub fn watch(&mut self) -> Arc<Mutex<EventCollector>> {
        let collector = Arc::new(Mutex::new(EventCollector::new()));
        self.engine.subscribe(collect_into(collector.clone()));
        collector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_fixture_machine() {
        let fx = Fixture::new();
        assert_eq!(fx.engine.graph().extruders(fx.global).unwrap(), fx.extruders.as_slice());
        assert_eq!(fx.engine.value(fx.global, "machine_height"), Some(Value::Float(180.0)));
        assert_eq!(fx.engine.value(fx.global, "adhesion_type"), Some(Value::String("brim".into())));
    }
}
