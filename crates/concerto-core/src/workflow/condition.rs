//! Typed predicates over the context, used for loop termination and gates.
//!
//! ```yaml
//! stop_when:
//!   any:
//!     - equals: { key: verdict, value: APPROVED }
//!     - matches: { key: notes, pattern: "(?i)ship it" }
//! ```

use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Context;

/// In-process predicate. Only constructible from Rust, never from YAML.
#[derive(Clone)]
pub struct Predicate(Arc<dyn Fn(&Context) -> bool + Send + Sync>);

impl Predicate {
    pub fn new(f: impl Fn(&Context) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }
}

impl std::fmt::Debug for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Predicate(..)")
    }
}

/// A regular expression, compiled once when the condition is built or loaded.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Pattern {
    source: String,
    compiled: Result<Regex, regex::Error>,
}

impl Pattern {
    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn is_match(&self, text: &str) -> bool {
        match &self.compiled {
            Ok(re) => re.is_match(text),
            Err(_) => false,
        }
    }
}

impl From<String> for Pattern {
    fn from(source: String) -> Self {
        let compiled = Regex::new(&source);
        if let Err(e) = &compiled {
            tracing::warn!("[Condition] Invalid pattern '{}' never matches: {}", source, e);
        }
        Self { source, compiled }
    }
}

impl From<Pattern> for String {
    fn from(pattern: Pattern) -> Self {
        pattern.source
    }
}

impl std::fmt::Debug for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pattern({:?})", self.source)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// The key is present
    Exists(String),
    Equals {
        key: String,
        value: Value,
    },
    /// String value contains a substring, or array value contains an element
    Contains {
        key: String,
        value: Value,
    },
    /// String value matches a regular expression
    Matches {
        key: String,
        pattern: Pattern,
    },
    Not(Box<Condition>),
    All(Vec<Condition>),
    Any(Vec<Condition>),
    #[serde(skip)]
    Custom(Predicate),
}

impl Condition {
    pub fn exists(key: impl Into<String>) -> Self {
        Condition::Exists(key.into())
    }

    pub fn equals(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Equals {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn contains(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Contains {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn matches(key: impl Into<String>, pattern: impl Into<String>) -> Self {
        Condition::Matches {
            key: key.into(),
            pattern: Pattern::from(pattern.into()),
        }
    }

    /// Parse a standalone condition document.
    ///
    /// Goes through a JSON value so the `any: [...]` map form reads the same
    /// here as it does nested inside a plan.
    pub fn from_yaml(yaml: &str) -> Result<Self, String> {
        let value: Value = serde_yaml::from_str(yaml)
            .map_err(|e| format!("Failed to parse condition YAML: {}", e))?;
        serde_json::from_value(value).map_err(|e| format!("Invalid condition: {}", e))
    }

    pub fn custom(f: impl Fn(&Context) -> bool + Send + Sync + 'static) -> Self {
        Condition::Custom(Predicate::new(f))
    }

    pub fn evaluate(&self, ctx: &Context) -> bool {
        match self {
            Condition::Exists(key) => ctx.contains(key),
            Condition::Equals { key, value } => ctx.get(key) == Some(value),
            Condition::Contains { key, value } => match (ctx.get(key), value) {
                (Some(Value::String(haystack)), Value::String(needle)) => {
                    haystack.contains(needle.as_str())
                }
                (Some(Value::Array(items)), needle) => items.contains(needle),
                _ => false,
            },
            Condition::Matches { key, pattern } => {
                ctx.get_str(key).is_some_and(|text| pattern.is_match(text))
            }
            Condition::Not(inner) => !inner.evaluate(ctx),
            Condition::All(all) => all.iter().all(|c| c.evaluate(ctx)),
            Condition::Any(any) => any.iter().any(|c| c.evaluate(ctx)),
            Condition::Custom(predicate) => (predicate.0)(ctx),
        }
    }

    /// Problems that would make this condition misbehave at runtime.
    pub(crate) fn issues(&self) -> Vec<String> {
        match self {
            Condition::Matches { pattern, .. } => match &pattern.compiled {
                Ok(_) => vec![],
                Err(e) => vec![format!("invalid pattern '{}': {}", pattern.as_str(), e)],
            },
            Condition::Not(inner) => inner.issues(),
            Condition::All(list) | Condition::Any(list) => {
                list.iter().flat_map(|c| c.issues()).collect()
            }
            _ => vec![],
        }
    }
}
