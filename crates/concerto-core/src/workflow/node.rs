//! Composition nodes, the immutable description of a plan.
//!
//! Nodes are values. Running a plan never mutates it; every execution produces
//! fresh [`NodeResult`](crate::engine::NodeResult)s.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Context;
use crate::error::EngineError;
use crate::registry::AgentRef;

use super::condition::Condition;

/// Where one field of a leaf's input comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSource {
    /// Copy the value of a context key
    From(String),
    /// Use a literal value
    Value(Value),
}

/// Builds an agent's input object from the context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputMapping(BTreeMap<String, InputSource>);

impl InputMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_key(mut self, field: impl Into<String>, key: impl Into<String>) -> Self {
        self.0.insert(field.into(), InputSource::From(key.into()));
        self
    }

    pub fn value(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), InputSource::Value(value.into()));
        self
    }

    /// Context keys this mapping reads.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.values().filter_map(|s| match s {
            InputSource::From(key) => Some(key.as_str()),
            InputSource::Value(_) => None,
        })
    }

    /// Resolve into a JSON object. A referenced key that is not set is an error.
    pub fn resolve(&self, ctx: &Context, agent: &str) -> Result<Value, EngineError> {
        let mut input = serde_json::Map::new();
        for (field, source) in &self.0 {
            let value = match source {
                InputSource::From(key) => ctx
                    .get(key)
                    .cloned()
                    .ok_or_else(|| EngineError::MissingInput {
                        agent: agent.to_string(),
                        key: key.clone(),
                    })?,
                InputSource::Value(v) => v.clone(),
            };
            input.insert(field.clone(), value);
        }
        Ok(Value::Object(input))
    }
}

/// A single agent call whose output is stored under `output_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeafNode {
    pub agent: String,

    /// Pinned contract version; latest when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,

    #[serde(default)]
    pub input: InputMapping,

    pub output_key: String,
}

impl LeafNode {
    pub fn new(agent: impl Into<String>, output_key: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            version: None,
            input: InputMapping::new(),
            output_key: output_key.into(),
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn input(mut self, input: InputMapping) -> Self {
        self.input = input;
        self
    }

    pub fn agent_ref(&self) -> AgentRef {
        AgentRef {
            name: self.agent.clone(),
            version: self.version,
        }
    }
}

impl From<LeafNode> for CompositionNode {
    fn from(leaf: LeafNode) -> Self {
        CompositionNode::Leaf(leaf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// First failing branch cancels the others (default)
    #[default]
    AbortAll,
    /// Every branch runs to completion
    BestEffort,
}

/// A named parallel branch. The id qualifies the keys the branch writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    pub node: CompositionNode,
}

impl Branch {
    pub fn new(id: impl Into<String>, node: impl Into<CompositionNode>) -> Self {
        Self {
            id: id.into(),
            node: node.into(),
        }
    }
}

/// Identifier of a coordinator cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub String);

impl ClusterId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClusterId {
    fn from(s: &str) -> Self {
        ClusterId(s.to_string())
    }
}

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// In-process classifier. Only constructible from Rust, never from YAML.
#[derive(Clone)]
pub struct ClassifierFn(pub(crate) Arc<dyn Fn(&Context) -> ClusterId + Send + Sync>);

impl std::fmt::Debug for ClassifierFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ClassifierFn(..)")
    }
}

/// Agent whose output names the cluster: a string, or an object with a `cluster` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentClassifier {
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default)]
    pub input: InputMapping,
}

impl AgentClassifier {
    pub fn agent_ref(&self) -> AgentRef {
        AgentRef {
            name: self.agent.clone(),
            version: self.version,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classifier {
    /// The context value under this key names the cluster
    Key(String),
    Agent(AgentClassifier),
    #[serde(skip)]
    Custom(ClassifierFn),
}

impl Classifier {
    pub fn key(key: impl Into<String>) -> Self {
        Classifier::Key(key.into())
    }

    pub fn agent(agent: impl Into<String>, input: InputMapping) -> Self {
        Classifier::Agent(AgentClassifier {
            agent: agent.into(),
            version: None,
            input,
        })
    }

    pub fn custom(f: impl Fn(&Context) -> ClusterId + Send + Sync + 'static) -> Self {
        Classifier::Custom(ClassifierFn(Arc::new(f)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GateCondition {
    /// Wait for an external signal
    #[default]
    External,
    /// Pass without waiting if the condition already holds, otherwise wait
    When(Condition),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnTimeout {
    #[default]
    Cancel,
    /// Continue as if approved; the trace records that the timeout fired
    ProceedDefault,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateNode {
    pub name: String,

    #[serde(default)]
    pub condition: GateCondition,

    pub timeout_ms: u64,

    #[serde(default)]
    pub on_timeout: OnTimeout,
}

impl GateNode {
    pub fn external(name: impl Into<String>, timeout: Duration, on_timeout: OnTimeout) -> Self {
        Self {
            name: name.into(),
            condition: GateCondition::External,
            timeout_ms: timeout.as_millis() as u64,
            on_timeout,
        }
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = GateCondition::When(condition);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl From<GateNode> for CompositionNode {
    fn from(gate: GateNode) -> Self {
        CompositionNode::Gate(gate)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompositionNode {
    Leaf(LeafNode),
    Sequential {
        children: Vec<CompositionNode>,
    },
    Parallel {
        branches: Vec<Branch>,
        #[serde(default)]
        failure_policy: FailurePolicy,
    },
    Loop {
        body: Box<CompositionNode>,
        stop_when: Condition,
        max_iterations: u32,
    },
    Coordinator {
        classifier: Classifier,
        clusters: BTreeMap<ClusterId, CompositionNode>,
    },
    Gate(GateNode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Leaf,
    Sequential,
    Parallel,
    Loop,
    Coordinator,
    Gate,
}

impl CompositionNode {
    pub fn sequential(children: impl IntoIterator<Item = CompositionNode>) -> Self {
        CompositionNode::Sequential {
            children: children.into_iter().collect(),
        }
    }

    pub fn parallel(branches: impl IntoIterator<Item = Branch>, failure_policy: FailurePolicy) -> Self {
        CompositionNode::Parallel {
            branches: branches.into_iter().collect(),
            failure_policy,
        }
    }

    pub fn repeat(body: impl Into<CompositionNode>, stop_when: Condition, max_iterations: u32) -> Self {
        CompositionNode::Loop {
            body: Box::new(body.into()),
            stop_when,
            max_iterations,
        }
    }

    pub fn coordinator<I, K>(classifier: Classifier, clusters: I) -> Self
    where
        I: IntoIterator<Item = (K, CompositionNode)>,
        K: Into<ClusterId>,
    {
        CompositionNode::Coordinator {
            classifier,
            clusters: clusters.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            CompositionNode::Leaf(_) => NodeKind::Leaf,
            CompositionNode::Sequential { .. } => NodeKind::Sequential,
            CompositionNode::Parallel { .. } => NodeKind::Parallel,
            CompositionNode::Loop { .. } => NodeKind::Loop,
            CompositionNode::Coordinator { .. } => NodeKind::Coordinator,
            CompositionNode::Gate(_) => NodeKind::Gate,
        }
    }

    /// Short human label used in traces and progress events.
    pub fn label(&self) -> Option<String> {
        match self {
            CompositionNode::Leaf(leaf) => Some(leaf.agent_ref().to_string()),
            CompositionNode::Gate(gate) => Some(gate.name.clone()),
            _ => None,
        }
    }
}

/// Path of a child node, as used in traces, audit records and gate ids.
pub fn child_path(parent: &str, segment: impl std::fmt::Display) -> String {
    format!("{}/{}", parent, segment)
}
