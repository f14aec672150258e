//! Structural shapes for agent inputs and outputs.
//!
//! A shape only checks structure (types, required fields). It never interprets
//! values. Shapes are written in YAML next to the contract:
//!
//! ```yaml
//! input_shape:
//!   type: object
//!   required: [topic]
//!   fields:
//!     topic: { type: string }
//!     notes: { type: array, items: { type: string } }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A structural schema over JSON values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Shape {
    #[default]
    Any,
    Null,
    Bool,
    Number,
    Integer,
    String,
    Array {
        #[serde(default)]
        items: Box<Shape>,
    },
    Object {
        #[serde(default)]
        fields: BTreeMap<String, Shape>,
        #[serde(default)]
        required: Vec<String>,
        /// Whether keys not listed in `fields` are allowed
        #[serde(default = "default_additional")]
        additional: bool,
    },
    OneOf {
        variants: Vec<Shape>,
    },
}

fn default_additional() -> bool {
    true
}

/// First structural mismatch found while validating a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShapeError {
    #[error("{path}: expected {expected}, found {found}")]
    Mismatch {
        path: String,
        expected: String,
        found: String,
    },

    #[error("{path}: missing required field '{field}'")]
    MissingField { path: String, field: String },

    #[error("{path}: unexpected field '{field}'")]
    UnexpectedField { path: String, field: String },

    #[error("{path}: value matches none of the {count} allowed shapes")]
    NoVariantMatched { path: String, count: usize },
}

impl Shape {
    /// Object shape with the given required string fields.
    pub fn object_with_strings(fields: &[&str]) -> Self {
        Shape::Object {
            fields: fields
                .iter()
                .map(|f| (f.to_string(), Shape::String))
                .collect(),
            required: fields.iter().map(|f| f.to_string()).collect(),
            additional: true,
        }
    }

    pub fn validate(&self, value: &Value) -> Result<(), ShapeError> {
        self.validate_at("$", value)
    }

    fn validate_at(&self, path: &str, value: &Value) -> Result<(), ShapeError> {
        match (self, value) {
            (Shape::Any, _) => Ok(()),
            (Shape::Null, Value::Null) => Ok(()),
            (Shape::Bool, Value::Bool(_)) => Ok(()),
            (Shape::Number, Value::Number(_)) => Ok(()),
            (Shape::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(()),
            (Shape::String, Value::String(_)) => Ok(()),
            (Shape::Array { items }, Value::Array(values)) => {
                for (i, item) in values.iter().enumerate() {
                    items.validate_at(&format!("{}[{}]", path, i), item)?;
                }
                Ok(())
            }
            (
                Shape::Object {
                    fields,
                    required,
                    additional,
                },
                Value::Object(map),
            ) => {
                for field in required {
                    if !map.contains_key(field) {
                        return Err(ShapeError::MissingField {
                            path: path.to_string(),
                            field: field.clone(),
                        });
                    }
                }
                for (key, val) in map {
                    match fields.get(key) {
                        Some(shape) => shape.validate_at(&format!("{}.{}", path, key), val)?,
                        None if *additional => {}
                        None => {
                            return Err(ShapeError::UnexpectedField {
                                path: path.to_string(),
                                field: key.clone(),
                            })
                        }
                    }
                }
                Ok(())
            }
            (Shape::OneOf { variants }, _) => {
                if variants.iter().any(|v| v.validate_at(path, value).is_ok()) {
                    Ok(())
                } else {
                    Err(ShapeError::NoVariantMatched {
                        path: path.to_string(),
                        count: variants.len(),
                    })
                }
            }
            (expected, found) => Err(ShapeError::Mismatch {
                path: path.to_string(),
                expected: expected.type_name().to_string(),
                found: json_type_name(found).to_string(),
            }),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Shape::Any => "any",
            Shape::Null => "null",
            Shape::Bool => "bool",
            Shape::Number => "number",
            Shape::Integer => "integer",
            Shape::String => "string",
            Shape::Array { .. } => "array",
            Shape::Object { .. } => "object",
            Shape::OneOf { .. } => "one_of",
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
