//! Raw definition records as supplied by a definition loader.
//!
//! ```json
//! {
//!   "id": "fdmprinter",
//!   "name": "FFF Printer",
//!   "inherits": null,
//!   "metadata": { "type": "machine" },
//!   "settings": {
//!     "resolution": {
//!       "label": "Quality", "type": "category",
//!       "children": {
//!         "layer_height": { "label": "Layer Height", "type": "float", "default_value": 0.1 }
//!       }
//!     }
//!   },
//!   "overrides": { "layer_height": { "default_value": 0.15 } }
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::DefinitionError;

pub type JsonMap = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherits: Option<String>,
    #[serde(default)]
    pub metadata: JsonMap,
    /// Ordered setting tree. New keys; or, for keys already inherited,
    /// field replacements in place.
    #[serde(default)]
    pub settings: JsonMap,
    /// Field replacements for inherited keys, addressed by key.
    #[serde(default)]
    pub overrides: JsonMap,
}

impl RawDefinition {
    pub fn from_json_str(text: &str) -> Result<Self, DefinitionError> {
        serde_json::from_str(text).map_err(|e| DefinitionError::malformed("<unparsed>", e.to_string()))
    }

    pub fn from_json_value(value: serde_json::Value) -> Result<Self, DefinitionError> {
        let family = value
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or("<unnamed>")
            .to_string();
        serde_json::from_value(value).map_err(|e| DefinitionError::malformed(&family, e.to_string()))
    }
}

/// Fields of one node with its `children` split off.
pub(crate) fn split_node<'a>(
    family: &str,
    key: &str,
    node: &'a serde_json::Value,
) -> Result<(JsonMap, Option<&'a JsonMap>), DefinitionError> {
    let Some(obj) = node.as_object() else {
        return Err(DefinitionError::malformed(family, format!("setting '{}' is not an object", key)));
    };
    let mut fields = JsonMap::new();
    let mut children = None;
    for (name, value) in obj {
        if name == "children" {
            match value.as_object() {
                Some(c) => children = Some(c),
                None => {
                    return Err(DefinitionError::malformed(
                        family,
                        format!("children of '{}' must be an object", key),
                    ))
                }
            }
        } else {
            fields.insert(name.clone(), value.clone());
        }
    }
    Ok((fields, children))
}
