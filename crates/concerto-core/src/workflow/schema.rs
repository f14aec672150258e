//! YAML plan documents and static plan validation.
//!
//! ```yaml
//! name: "Review Flow"
//! description: "Draft, critique until approved, then wait for sign-off"
//! version: "1.0"
//!
//! root:
//!   kind: sequential
//!   children:
//!     - kind: leaf
//!       agent: drafter
//!       input: { topic: { from: topic } }
//!       output_key: draft
//!     - kind: loop
//!       max_iterations: 5
//!       stop_when: { equals: { key: verdict, value: APPROVED } }
//!       body:
//!         kind: leaf
//!         agent: critic
//!         input: { text: { from: draft } }
//!         output_key: verdict
//!     - kind: gate
//!       name: publish
//!       timeout_ms: 3600000
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::context::BRANCH_SEPARATOR;
use crate::error::PlanError;
use crate::registry::{AgentRef, CapabilityRegistry};

use super::node::{child_path, Classifier, CompositionNode, GateCondition};

/// Path of the root node in traces.
pub const ROOT_PATH: &str = "root";

/// Top-level plan loaded from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDefinition {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default = "default_version")]
    pub version: String,

    pub root: CompositionNode,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl PlanDefinition {
    pub fn new(name: impl Into<String>, root: CompositionNode) -> Self {
        Self {
            name: name.into(),
            description: None,
            version: default_version(),
            root,
        }
    }

    /// Parse a plan definition from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, PlanError> {
        serde_yaml::from_str(yaml).map_err(|e| PlanError::Parse(e.to_string()))
    }

    /// Load a plan definition from a file path.
    pub fn from_file(path: &str) -> Result<Self, PlanError> {
        let content = std::fs::read_to_string(path).map_err(|e| PlanError::Read {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self, registry: &CapabilityRegistry) -> Result<(), PlanError> {
        validate_node(&self.root, registry)
    }
}

/// Check a plan against the registry before running it.
///
/// Every issue is reported with the path of the offending node, e.g.
/// `root/1/research: Capability not found: scholar`.
pub fn validate_node(root: &CompositionNode, registry: &CapabilityRegistry) -> Result<(), PlanError> {
    let mut issues = Vec::new();
    collect_issues(root, ROOT_PATH, registry, &mut issues);
    if issues.is_empty() {
        Ok(())
    } else {
        Err(PlanError::Invalid(issues))
    }
}

fn collect_issues(
    node: &CompositionNode,
    path: &str,
    registry: &CapabilityRegistry,
    issues: &mut Vec<String>,
) {
    let mut issue = |msg: String| issues.push(format!("{}: {}", path, msg));
    let check_agent = |agent: &AgentRef, issue: &mut dyn FnMut(String)| {
        if let Err(e) = registry.resolve_ref(agent) {
            issue(e.to_string());
        }
    };

    match node {
        CompositionNode::Leaf(leaf) => {
            check_agent(&leaf.agent_ref(), &mut issue);
            if leaf.output_key.trim().is_empty() {
                issue("leaf output_key is empty".to_string());
            }
        }
        CompositionNode::Sequential { children } => {
            for (i, child) in children.iter().enumerate() {
                collect_issues(child, &child_path(path, i), registry, issues);
            }
        }
        CompositionNode::Parallel { branches, .. } => {
            if branches.is_empty() {
                issue("parallel node has no branches".to_string());
            }
            let mut seen = HashSet::new();
            for branch in branches {
                if branch.id.is_empty() || branch.id.contains(BRANCH_SEPARATOR) || branch.id.contains('/') {
                    issue(format!(
                        "branch id '{}' must be non-empty and contain no '{}' or '/'",
                        branch.id, BRANCH_SEPARATOR
                    ));
                }
                if !seen.insert(branch.id.as_str()) {
                    issue(format!("duplicate branch id '{}'", branch.id));
                }
            }
            for branch in branches {
                collect_issues(&branch.node, &child_path(path, &branch.id), registry, issues);
            }
        }
        CompositionNode::Loop {
            body,
            stop_when,
            max_iterations,
        } => {
            if *max_iterations == 0 {
                issue("loop max_iterations must be at least 1".to_string());
            }
            for problem in stop_when.issues() {
                issue(format!("stop_when: {}", problem));
            }
            collect_issues(body, &child_path(path, "iter1"), registry, issues);
        }
        CompositionNode::Coordinator {
            classifier,
            clusters,
        } => {
            if clusters.is_empty() {
                issue("coordinator has no clusters".to_string());
            }
            if let Classifier::Agent(agent) = classifier {
                check_agent(&agent.agent_ref(), &mut issue);
            }
            for (id, cluster) in clusters {
                collect_issues(cluster, &child_path(path, id), registry, issues);
            }
        }
        CompositionNode::Gate(gate) => {
            if gate.name.trim().is_empty() {
                issue("gate name is empty".to_string());
            }
            if gate.timeout_ms == 0 {
                issue(format!("gate '{}' timeout must be greater than zero", gate.name));
            }
            if let GateCondition::When(cond) = &gate.condition {
                for problem in cond.issues() {
                    issue(format!("condition: {}", problem));
                }
            }
        }
    }
}
