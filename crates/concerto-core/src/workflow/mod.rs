//! Workflow plans: composition nodes, conditions and YAML plan documents.
//!
//! A plan is an immutable tree of composition nodes:
//!
//! ```text
//! plan.yaml ──► PlanDefinition ──► CompositionNode tree
//!                                    │
//!                 Leaf ─ Sequential ─ Parallel ─ Loop ─ Coordinator ─ Gate
//!                                    │
//!                              Engine::run / submit
//! ```

pub mod condition;
pub mod node;
pub mod schema;

pub use condition::{Condition, Pattern, Predicate};
pub use node::{
    child_path, AgentClassifier, Branch, Classifier, ClassifierFn, ClusterId, CompositionNode,
    FailurePolicy, GateCondition, GateNode, InputMapping, InputSource, LeafNode, NodeKind,
    OnTimeout,
};
pub use schema::{validate_node, PlanDefinition, ROOT_PATH};
