//! Per-model device definitions.
//!
//! A definition lists the properties a model exposes. When a device matches
//! one, bus commands are checked against it before encoding. Definitions are
//! JSON or JSON5 files in the configured directory; a broken file is logged
//! and skipped.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::translator::EncodingError;

/// Access flags on an exposed property.
pub mod access {
    /// Published in the state document.
    pub const STATE: u8 = 0x01;
    /// Settable through `/set`.
    pub const SET: u8 = 0x02;
    /// Readable through `/get`.
    pub const GET: u8 = 0x04;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposeType {
    Binary,
    Numeric,
    Enum,
    Text,
}

/// One exposed property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expose {
    #[serde(rename = "type")]
    pub kind: ExposeType,
    pub name: String,
    pub property: String,
    #[serde(default = "default_access")]
    pub access: u8,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub value_toggle: Option<String>,
    #[serde(default)]
    pub value_min: Option<f64>,
    #[serde(default)]
    pub value_max: Option<f64>,
}

fn default_access() -> u8 {
    access::STATE | access::SET | access::GET
}

/// A device model definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDefinition {
    pub model_id: String,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub supports: Vec<String>,
    #[serde(default)]
    pub exposes: Vec<Expose>,
}

impl DeviceDefinition {
    pub fn expose(&self, property: &str) -> Option<&Expose> {
        self.exposes.iter().find(|e| e.property == property)
    }

    /// Check a `/set` value against the definition.
    pub fn validate_set(&self, property: &str, value: &Value) -> Result<(), EncodingError> {
        let expose = self.expose(property).ok_or_else(|| EncodingError::NotExposed {
            field: property.to_string(),
            model: self.model_id.clone(),
        })?;
        if expose.access & access::SET == 0 {
            return Err(EncodingError::ReadOnly(property.to_string()));
        }
        expose.validate(value)
    }

    /// Check that a `/get` is allowed.
    pub fn validate_get(&self, property: &str) -> Result<(), EncodingError> {
        let expose = self.expose(property).ok_or_else(|| EncodingError::NotExposed {
            field: property.to_string(),
            model: self.model_id.clone(),
        })?;
        if expose.access & access::GET == 0 {
            return Err(EncodingError::InvalidValue {
                field: property.to_string(),
                message: "property cannot be read".to_string(),
            });
        }
        Ok(())
    }
}

impl Expose {
    fn validate(&self, value: &Value) -> Result<(), EncodingError> {
        let invalid = |message: String| EncodingError::InvalidValue {
            field: self.property.clone(),
            message,
        };
        match self.kind {
            ExposeType::Binary | ExposeType::Enum => {
                let Value::String(s) = value else {
                    return Err(invalid(format!("expected one of {:?}", self.values)));
                };
                let allowed = self
                    .values
                    .iter()
                    .chain(self.value_toggle.iter())
                    .any(|v| v.eq_ignore_ascii_case(s));
                if !allowed {
                    return Err(invalid(format!("'{}' is not one of {:?}", s, self.values)));
                }
                Ok(())
            }
            ExposeType::Numeric => {
                let number = value
                    .as_f64()
                    .ok_or_else(|| invalid(format!("expected a number, got {}", value)))?;
                let below = self.value_min.is_some_and(|min| number < min);
                let above = self.value_max.is_some_and(|max| number > max);
                if below || above {
                    return Err(EncodingError::OutOfRange {
                        field: self.property.clone(),
                        value: number,
                        min: self.value_min.unwrap_or(f64::MIN),
                        max: self.value_max.unwrap_or(f64::MAX),
                    });
                }
                Ok(())
            }
            ExposeType::Text => match value {
                Value::String(_) => Ok(()),
                other => Err(invalid(format!("expected a string, got {}", other))),
            },
        }
    }
}

/// Loaded definitions keyed by model id.
#[derive(Debug, Clone, Default)]
pub struct Definitions {
    by_model: BTreeMap<String, DeviceDefinition>,
}

impl Definitions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `.json` / `.json5` file in `dir`. A missing directory yields
    /// no definitions.
    pub fn load_dir(dir: &Path) -> Self {
        let mut definitions = Self::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "No device definitions loaded");
                return definitions;
            }
        };

        let mut paths: Vec<_> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e == "json" || e == "json5")
            })
            .collect();
        paths.sort();

        for path in paths {
            let parsed = std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|s| json5::from_str::<DeviceDefinition>(&s).map_err(|e| e.to_string()));
            match parsed {
                Ok(definition) => {
                    info!(model = %definition.model_id, file = %path.display(), "Loaded device definition");
                    definitions.insert(definition);
                }
                Err(e) => error!(file = %path.display(), error = %e, "Invalid device definition"),
            }
        }
        definitions
    }

    pub fn insert(&mut self, definition: DeviceDefinition) {
        self.by_model.insert(definition.model_id.clone(), definition);
    }

    pub fn len(&self) -> usize {
        self.by_model.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_model.is_empty()
    }

    /// Definition for a device: exact model match first, then vendor.
    pub fn identify(
        &self,
        model: Option<&str>,
        manufacturer: Option<&str>,
    ) -> Option<&DeviceDefinition> {
        if let Some(found) = model.and_then(|m| self.by_model.get(m)) {
            return Some(found);
        }
        let manufacturer = manufacturer?;
        self.by_model.values().find(|d| {
            d.vendor
                .as_deref()
                .is_some_and(|v| v.eq_ignore_ascii_case(manufacturer))
        })
    }
}
