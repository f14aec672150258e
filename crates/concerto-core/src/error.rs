//! Core error types for the Concerto engine.
//!
//! `EngineError` is the engine's error taxonomy. Node results never carry the
//! error value itself; they carry an [`ErrorRecord`] (kind + message) so traces
//! stay cloneable and serializable.

use serde::{Deserialize, Serialize};

use crate::registry::ShapeError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// Input or output did not match the contract's declared shape. Never retried.
    #[error("Validation error for '{agent}': {source}")]
    Validation {
        agent: String,
        #[source]
        source: ShapeError,
    },

    /// An input mapping referenced a context key that does not exist.
    #[error("Missing input for '{agent}': context key '{key}' is not set")]
    MissingInput { agent: String, key: String },

    #[error("Capability not found: {name}{}", .version.map(|v| format!(" v{}", v)).unwrap_or_default())]
    CapabilityNotFound { name: String, version: Option<u32> },

    #[error("Duplicate capability version: {name} v{version}")]
    DuplicateVersion { name: String, version: u32 },

    #[error("Agent '{agent}' timed out after {timeout_ms}ms")]
    Timeout { agent: String, timeout_ms: u64 },

    #[error("Agent '{agent}' failed: {message}")]
    Invocation { agent: String, message: String },

    #[error("Unknown cluster '{cluster}'")]
    UnknownCluster { cluster: String },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid plan: {0}")]
    Plan(#[from] PlanError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation { .. } | EngineError::MissingInput { .. } => {
                ErrorKind::Validation
            }
            EngineError::CapabilityNotFound { .. } => ErrorKind::CapabilityNotFound,
            EngineError::DuplicateVersion { .. } => ErrorKind::DuplicateVersion,
            EngineError::Timeout { .. } => ErrorKind::Timeout,
            EngineError::Invocation { .. } => ErrorKind::Invocation,
            EngineError::UnknownCluster { .. } => ErrorKind::UnknownCluster,
            EngineError::Cancelled(_) => ErrorKind::Cancelled,
            EngineError::Plan(_) => ErrorKind::Plan,
            EngineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the leaf invoker may retry after this error (given an idempotent agent).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Timeout { .. } | EngineError::Invocation { .. }
        )
    }

    pub fn record(&self) -> ErrorRecord {
        ErrorRecord {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Error kinds as they appear in traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    CapabilityNotFound,
    DuplicateVersion,
    Timeout,
    Invocation,
    UnknownCluster,
    Cancelled,
    Plan,
    Internal,
}

/// Serializable error attached to a node result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorRecord {
    pub fn cancelled(reason: impl Into<String>) -> Self {
        EngineError::Cancelled(reason.into()).record()
    }
}

/// Problems found while loading or validating a plan.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlanError {
    #[error("Failed to read plan file '{path}': {message}")]
    Read { path: String, message: String },

    #[error("Failed to parse plan YAML: {0}")]
    Parse(String),

    #[error("{}", .0.join("; "))]
    Invalid(Vec<String>),
}
