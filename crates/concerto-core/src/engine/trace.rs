//! Execution trace: one `NodeResult` per executed (or skipped) node.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{ContextSnapshot, WriteRecord};
use crate::error::ErrorRecord;
use crate::workflow::{ClusterId, CompositionNode, NodeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Completed,
    Failed,
    Cancelled,
    PartiallyCompleted,
    /// Never started because an earlier sibling failed or was cancelled
    Skipped,
}

impl NodeStatus {
    /// Whether execution continues past a node with this status.
    pub fn is_success(self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::PartiallyCompleted)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Cancelled => "cancelled",
            NodeStatus::PartiallyCompleted => "partially_completed",
            NodeStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// How a gate node was passed (or not).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateResolution {
    Approved,
    Rejected,
    TimedOutCancelled,
    TimedOutProceeded,
    /// A `when` gate whose condition already held
    PassedCondition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResult {
    pub path: String,
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub status: NodeStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    /// Leaf and agent-classifier call attempts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    /// Loop stopped at `max_iterations` without its condition holding
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub exceeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateResolution>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeResult>,
}

impl NodeResult {
    pub(crate) fn started(node: &CompositionNode, path: &str) -> Self {
        Self {
            path: path.to_string(),
            kind: node.kind(),
            label: node.label(),
            status: NodeStatus::Completed,
            started_at: Utc::now(),
            duration_ms: 0,
            error: None,
            attempts: None,
            iterations: None,
            exceeded: false,
            cluster: None,
            gate: None,
            children: Vec::new(),
        }
    }

    pub(crate) fn skipped(node: &CompositionNode, path: &str) -> Self {
        Self {
            status: NodeStatus::Skipped,
            ..Self::started(node, path)
        }
    }

    /// Find a node by path anywhere in this subtree.
    pub fn find(&self, path: &str) -> Option<&NodeResult> {
        if self.path == path {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(path))
    }

    /// Every node of the subtree, depth-first, parents before children.
    pub fn flatten(&self) -> Vec<&NodeResult> {
        let mut nodes = vec![self];
        for child in &self.children {
            nodes.extend(child.flatten());
        }
        nodes
    }

    /// Deepest-first error: the one that actually caused this subtree to stop.
    pub fn root_cause(&self) -> Option<&ErrorRecord> {
        self.children
            .iter()
            .find_map(|child| child.root_cause())
            .or(self.error.as_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Completed,
    Failed,
    Cancelled,
    PartiallyCompleted,
}

impl From<NodeStatus> for WorkflowStatus {
    fn from(status: NodeStatus) -> Self {
        match status {
            NodeStatus::Completed => WorkflowStatus::Completed,
            NodeStatus::Failed => WorkflowStatus::Failed,
            NodeStatus::PartiallyCompleted => WorkflowStatus::PartiallyCompleted,
            NodeStatus::Cancelled | NodeStatus::Skipped => WorkflowStatus::Cancelled,
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
            WorkflowStatus::PartiallyCompleted => "partially_completed",
        };
        f.write_str(s)
    }
}

/// Everything a finished run leaves behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResult {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    pub status: WorkflowStatus,
    pub context: ContextSnapshot,
    pub audit: Vec<WriteRecord>,
    pub trace: NodeResult,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl WorkflowResult {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.context.get(key)
    }

    pub fn node(&self, path: &str) -> Option<&NodeResult> {
        self.trace.find(path)
    }
}
