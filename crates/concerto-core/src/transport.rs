//! Agent transport, the single seam between the engine and agent implementations.
//!
//! The engine only ever calls [`AgentTransport::invoke`]. How the request reaches
//! an agent (HTTP, stdio, in-process) is the transport's business. Two in-process
//! transports ship with the crate:
//!
//! - [`AgentTable`]: name → [`Agent`] handler, for embedding agents as Rust code
//! - [`ScriptedAgent`]: canned responses with delays/failures, loaded from
//!   fixture YAML for dry runs and tests
//!
//! ```yaml
//! agents:
//!   - name: critic
//!     idempotent: true
//!     max_retries: 1
//!     responses:
//!       - output: { verdict: REVISE }
//!         delay_ms: 20
//!       - output: { verdict: APPROVED }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;
use crate::registry::{AgentContract, AgentRef, CapabilityRegistry};

/// Failure reported by an agent (or by the transport on its behalf).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct AgentFailure {
    pub message: String,
}

impl AgentFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Call/await primitive used by the leaf invoker. Possibly slow, possibly failing.
///
/// Implementations must not block the thread. The branches of a parallel node
/// are polled together on one task, so a blocking `invoke` runs them one after
/// another and also stalls timeouts and cancellation. Wrap blocking work in
/// `tokio::task::spawn_blocking`.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn invoke(&self, agent: &AgentRef, input: Value) -> Result<Value, AgentFailure>;
}

/// A request → response capability provider. Same non-blocking rule as
/// [`AgentTransport`].
#[async_trait]
pub trait Agent: Send + Sync {
    async fn handle(&self, input: Value) -> Result<Value, AgentFailure>;
}

/// Adapts an async closure into an [`Agent`].
pub struct FnAgent<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Agent for FnAgent<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, AgentFailure>> + Send,
{
    async fn handle(&self, input: Value) -> Result<Value, AgentFailure> {
        (self.f)(input).await
    }
}

pub fn agent_fn<F, Fut>(f: F) -> Arc<dyn Agent>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, AgentFailure>> + Send + 'static,
{
    Arc::new(FnAgent { f })
}

/// In-process transport dispatching by agent name (and optionally version).
#[derive(Default, Clone)]
pub struct AgentTable {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler used for every version of `name` without a dedicated handler.
    pub fn register(&mut self, name: impl Into<String>, agent: Arc<dyn Agent>) {
        self.agents.insert(name.into(), agent);
    }

    pub fn register_version(&mut self, name: &str, version: u32, agent: Arc<dyn Agent>) {
        self.agents.insert(format!("{}@{}", name, version), agent);
    }

    pub fn with(mut self, name: impl Into<String>, agent: Arc<dyn Agent>) -> Self {
        self.register(name, agent);
        self
    }

    /// Agent names with at least one handler, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .agents
            .keys()
            .map(|key| key.split_once('@').map(|(name, _)| name).unwrap_or(key).to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    fn lookup(&self, agent: &AgentRef) -> Option<&Arc<dyn Agent>> {
        agent
            .version
            .and_then(|v| self.agents.get(&format!("{}@{}", agent.name, v)))
            .or_else(|| self.agents.get(&agent.name))
    }
}

#[async_trait]
impl AgentTransport for AgentTable {
    async fn invoke(&self, agent: &AgentRef, input: Value) -> Result<Value, AgentFailure> {
        match self.lookup(agent) {
            Some(handler) => handler.handle(input).await,
            None => Err(AgentFailure::new(format!(
                "no handler registered for agent '{}'",
                agent
            ))),
        }
    }
}

/// One canned reply of a [`ScriptedAgent`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptedResponse {
    #[serde(default)]
    pub output: Option<Value>,

    /// When set, the call fails with this message instead of returning `output`
    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub delay_ms: u64,
}

impl ScriptedResponse {
    pub fn ok(output: Value) -> Self {
        Self {
            output: Some(output),
            ..Self::default()
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay_ms = delay.as_millis() as u64;
        self
    }
}

/// Replays responses in order; the last response repeats once the script runs out.
pub struct ScriptedAgent {
    responses: Vec<ScriptedResponse>,
    calls: AtomicUsize,
}

impl ScriptedAgent {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn handle(&self, _input: Value) -> Result<Value, AgentFailure> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let Some(response) = self
            .responses
            .get(n)
            .or_else(|| self.responses.last())
        else {
            return Ok(Value::Null);
        };
        if response.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(response.delay_ms)).await;
        }
        match &response.error {
            Some(message) => Err(AgentFailure::new(message.clone())),
            None => Ok(response.output.clone().unwrap_or(Value::Null)),
        }
    }
}

/// A contract plus the script its stand-in agent replays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentFixture {
    #[serde(flatten)]
    pub contract: AgentContract,

    #[serde(default)]
    pub responses: Vec<ScriptedResponse>,
}

/// Fixture YAML: the contracts to register and how each agent answers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureDocument {
    #[serde(default)]
    pub agents: Vec<AgentFixture>,
}

impl FixtureDocument {
    pub fn from_yaml(yaml: &str) -> Result<Self, String> {
        serde_yaml::from_str(yaml).map_err(|e| format!("Failed to parse fixture YAML: {}", e))
    }

    pub fn from_file(path: &str) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read fixture file '{}': {}", path, e))?;
        Self::from_yaml(&content)
    }

    /// Build the registry and the scripted transport described by this document.
    pub fn build(self) -> Result<(CapabilityRegistry, AgentTable), EngineError> {
        let mut registry = CapabilityRegistry::new();
        let mut table = AgentTable::new();
        for fixture in self.agents {
            let name = fixture.contract.name.clone();
            let version = fixture.contract.version;
            registry.register(fixture.contract)?;
            table.register_version(&name, version, Arc::new(ScriptedAgent::new(fixture.responses)));
        }
        Ok((registry, table))
    }
}
