//! Capability registry: agent name/version to contract.
//!
//! The registry is filled at startup and then shared immutably (`Arc`) with the
//! engine, so nothing can register new agents while a workflow is running.
//!
//! Contracts can also be loaded from YAML:
//!
//! ```yaml
//! contracts:
//!   - name: drafter
//!     version: 2
//!     idempotent: true
//!     max_retries: 2
//!     timeout_ms: 30000
//!     input_shape: { type: object, required: [topic] }
//!     output_shape: { type: string }
//! ```

mod shape;

pub use shape::{Shape, ShapeError};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Reference to an agent from a plan. `version: None` means "latest".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

impl AgentRef {
    pub fn latest(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    pub fn pinned(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version: Some(version),
        }
    }
}

impl std::fmt::Display for AgentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.version {
            Some(v) => write!(f, "{}@{}", self.name, v),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Declared capability of an agent. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentContract {
    pub name: String,

    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub input_shape: Shape,

    #[serde(default)]
    pub output_shape: Shape,

    /// Only idempotent agents are retried automatically
    #[serde(default)]
    pub idempotent: bool,

    #[serde(default)]
    pub max_retries: u32,

    /// Per-attempt timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_version() -> u32 {
    1
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl AgentContract {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            input_shape: Shape::Any,
            output_shape: Shape::Any,
            idempotent: false,
            max_retries: 0,
            timeout_ms: default_timeout_ms(),
        }
    }

    pub fn with_shapes(mut self, input: Shape, output: Shape) -> Self {
        self.input_shape = input;
        self.output_shape = output;
        self
    }

    pub fn idempotent(mut self, max_retries: u32) -> Self {
        self.idempotent = true;
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn agent_ref(&self) -> AgentRef {
        AgentRef::pinned(self.name.clone(), self.version)
    }
}

/// Top-level YAML document holding a list of contracts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContractDocument {
    #[serde(default)]
    pub contracts: Vec<AgentContract>,
}

/// In-memory registry of agent contracts, keyed by name then version.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    contracts: HashMap<String, BTreeMap<u32, Arc<AgentContract>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a contract. `(name, version)` pairs are never overwritten.
    pub fn register(&mut self, contract: AgentContract) -> Result<(), EngineError> {
        let versions = self.contracts.entry(contract.name.clone()).or_default();
        if versions.contains_key(&contract.version) {
            return Err(EngineError::DuplicateVersion {
                name: contract.name,
                version: contract.version,
            });
        }
        tracing::debug!(
            "[Registry] Registered {} v{} (idempotent: {}, retries: {})",
            contract.name,
            contract.version,
            contract.idempotent,
            contract.max_retries
        );
        versions.insert(contract.version, Arc::new(contract));
        Ok(())
    }

    /// Resolve a contract; without a version the highest registered one wins.
    pub fn resolve(&self, name: &str, version: Option<u32>) -> Result<Arc<AgentContract>, EngineError> {
        let not_found = || EngineError::CapabilityNotFound {
            name: name.to_string(),
            version,
        };
        let versions = self.contracts.get(name).ok_or_else(not_found)?;
        let found = match version {
            Some(v) => versions.get(&v),
            None => versions.values().next_back(),
        };
        found.cloned().ok_or_else(not_found)
    }

    pub fn resolve_ref(&self, agent: &AgentRef) -> Result<Arc<AgentContract>, EngineError> {
        self.resolve(&agent.name, agent.version)
    }

    /// Every registered contract, ordered by name then version.
    pub fn contracts(&self) -> Vec<Arc<AgentContract>> {
        let mut all: Vec<_> = self
            .contracts
            .values()
            .flat_map(|versions| versions.values().cloned())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
        all
    }

    pub fn len(&self) -> usize {
        self.contracts.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parse a YAML contract document and register every contract in it.
    pub fn load_yaml(&mut self, yaml: &str) -> Result<usize, String> {
        let doc: ContractDocument = serde_yaml::from_str(yaml)
            .map_err(|e| format!("Failed to parse contracts YAML: {}", e))?;
        let count = doc.contracts.len();
        for contract in doc.contracts {
            self.register(contract).map_err(|e| e.to_string())?;
        }
        Ok(count)
    }
}
