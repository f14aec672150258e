//! Concerto Core — composition engine for multi-agent workflows.
//!
//! A plan is a tree of composition nodes (leaf, sequential, parallel, loop,
//! coordinator, gate). The engine walks the tree against a per-run context,
//! calling agents through a single transport seam, and returns the final
//! context, its audit trail and a full execution trace.
//!
//! This crate has no HTTP or storage dependency. Agents are reached through
//! [`AgentTransport`]; the supplied [`AgentTable`] and [`ScriptedAgent`] cover
//! in-process handlers and fixture-driven runs.
//!
//! ```no_run
//! use std::sync::Arc;
//! use concerto_core::{Context, Engine, EngineConfig, FixtureDocument, PlanDefinition};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let (registry, agents) = FixtureDocument::from_file("agents.yaml")?.build()?;
//! let engine = Engine::new(Arc::new(registry), Arc::new(agents), EngineConfig::default());
//! let plan = PlanDefinition::from_file("review.yaml")?;
//! let result = engine.run(&plan, Context::new()).await?;
//! println!("{}: {:?}", result.run_id, result.status);
//! # Ok(())
//! # }
//! ```

pub mod context;
pub mod engine;
pub mod error;
pub mod gate;
pub mod invoker;
pub mod registry;
pub mod transport;
pub mod workflow;

// Convenience re-exports
pub use context::{Context, ContextSnapshot, ContextWrite, WriteRecord};
pub use engine::{
    Engine, EngineConfig, GateResolution, NodeResult, NodeStatus, ProgressEvent, RunStatus,
    WorkflowHandle, WorkflowResult, WorkflowStatus,
};
pub use error::{EngineError, ErrorKind, ErrorRecord, PlanError};
pub use gate::{GateController, PendingGate, SignalOutcome};
pub use invoker::BackoffConfig;
pub use registry::{AgentContract, AgentRef, CapabilityRegistry, Shape, ShapeError};
pub use transport::{
    agent_fn, Agent, AgentFailure, AgentTable, AgentTransport, FixtureDocument, ScriptedAgent,
    ScriptedResponse,
};
pub use workflow::{
    Branch, Classifier, ClusterId, CompositionNode, Condition, FailurePolicy, GateNode,
    InputMapping, LeafNode, OnTimeout, PlanDefinition,
};
