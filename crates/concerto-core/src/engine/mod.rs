//! Execution engine. Runs plans and tracks in-flight runs.
//!
//! `Engine::run` drives a plan to completion on the caller's task.
//! `Engine::submit` spawns the run and hands back a [`WorkflowHandle`] for
//! status polling, progress streaming, gate signals and cancellation.
//!
//! Each run owns one cancellation token; every node of the run observes it
//! (parallel branches through child tokens), so cancelling a handle stops new
//! work everywhere and abandons in-flight calls, backoff sleeps and gate waits.

mod executor;
pub mod progress;
pub mod trace;

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::EngineError;
use crate::gate::{gate_id, GateController, PendingGate, SignalOutcome};
use crate::invoker::{BackoffConfig, LeafInvoker};
use crate::registry::CapabilityRegistry;
use crate::transport::AgentTransport;
use crate::workflow::{validate_node, CompositionNode, PlanDefinition, ROOT_PATH};

use executor::Executor;
pub use progress::{ProgressEvent, ProgressHub};
pub use trace::{GateResolution, NodeResult, NodeStatus, WorkflowResult, WorkflowStatus};

// ─── Configuration ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retry backoff for idempotent agents
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Live progress events buffered per subscriber before it starts lagging
    #[serde(default = "default_progress_capacity")]
    pub progress_capacity: usize,

    /// Check plans against the registry before running them
    #[serde(default = "default_validate_plans")]
    pub validate_plans: bool,
}

fn default_progress_capacity() -> usize {
    256
}

fn default_validate_plans() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            progress_capacity: default_progress_capacity(),
            validate_plans: default_validate_plans(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, String> {
        serde_yaml::from_str(yaml).map_err(|e| format!("Failed to parse engine config: {}", e))
    }
}

// ─── Run status ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// Running, with at least one gate waiting for a signal
    WaitingOnGate,
    Finished(WorkflowStatus),
}

/// Everything one run needs besides the plan and its context.
struct RunSetup {
    run_id: String,
    plan: Option<String>,
    progress: Arc<ProgressHub>,
    cancel: CancellationToken,
}

// ─── Engine ───────────────────────────────────────────────────────────────

struct EngineInner {
    registry: Arc<CapabilityRegistry>,
    invoker: Arc<LeafInvoker>,
    gates: Arc<GateController>,
    config: EngineConfig,
}

/// Cheap to clone; clones share the registry, transport and gate controller.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        transport: Arc<dyn AgentTransport>,
        config: EngineConfig,
    ) -> Self {
        let invoker = Arc::new(LeafInvoker::new(transport, config.backoff));
        Self {
            inner: Arc::new(EngineInner {
                registry,
                invoker,
                gates: Arc::new(GateController::new()),
                config,
            }),
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The gate controller shared by every run of this engine.
    pub fn gates(&self) -> Arc<GateController> {
        self.inner.gates.clone()
    }

    pub fn resolve_gate(&self, gate_id: &str, approved: bool) -> SignalOutcome {
        self.inner.gates.resolve(gate_id, approved)
    }

    /// Run a plan to completion.
    pub async fn run(
        &self,
        plan: &PlanDefinition,
        initial: Context,
    ) -> Result<WorkflowResult, EngineError> {
        let setup = self.prepare(&plan.root, Some(plan.name.clone()))?;
        Ok(drive(self.inner.clone(), setup, &plan.root, initial).await)
    }

    /// Run a bare composition tree to completion.
    pub async fn run_node(
        &self,
        root: &CompositionNode,
        initial: Context,
    ) -> Result<WorkflowResult, EngineError> {
        let setup = self.prepare(root, None)?;
        Ok(drive(self.inner.clone(), setup, root, initial).await)
    }

    /// Start a plan in the background.
    pub fn submit(
        &self,
        plan: PlanDefinition,
        initial: Context,
    ) -> Result<WorkflowHandle, EngineError> {
        let setup = self.prepare(&plan.root, Some(plan.name.clone()))?;
        Ok(self.spawn(setup, plan.root, initial))
    }

    pub fn submit_node(
        &self,
        root: CompositionNode,
        initial: Context,
    ) -> Result<WorkflowHandle, EngineError> {
        let setup = self.prepare(&root, None)?;
        Ok(self.spawn(setup, root, initial))
    }

    fn prepare(
        &self,
        root: &CompositionNode,
        plan: Option<String>,
    ) -> Result<RunSetup, EngineError> {
        if self.inner.config.validate_plans {
            validate_node(root, &self.inner.registry)?;
        }
        let run_id = uuid::Uuid::new_v4().to_string();
        // Registered before any node runs so early gate signals are accepted.
        self.inner.gates.begin_run(&run_id);
        Ok(RunSetup {
            run_id,
            plan,
            progress: ProgressHub::new(self.inner.config.progress_capacity),
            cancel: CancellationToken::new(),
        })
    }

    fn spawn(&self, setup: RunSetup, root: CompositionNode, initial: Context) -> WorkflowHandle {
        let run_id = setup.run_id.clone();
        let cancel = setup.cancel.clone();
        let progress = setup.progress.clone();
        let (status_tx, status_rx) = watch::channel(None);

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let result = drive(inner, setup, &root, initial).await;
            let _ = status_tx.send(Some(result.status));
            result
        });

        WorkflowHandle {
            run_id,
            cancel,
            progress,
            gates: self.inner.gates.clone(),
            finished: status_rx,
            task,
        }
    }
}

/// Ends the run in the gate controller however `drive` exits, including when
/// the future driving it is dropped.
struct RunGuard {
    gates: Arc<GateController>,
    run_id: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.gates.end_run(&self.run_id);
    }
}

async fn drive(
    inner: Arc<EngineInner>,
    setup: RunSetup,
    root: &CompositionNode,
    initial: Context,
) -> WorkflowResult {
    let RunSetup {
        run_id,
        plan,
        progress,
        cancel,
    } = setup;
    let run_guard = RunGuard {
        gates: inner.gates.clone(),
        run_id: run_id.clone(),
    };
    tracing::info!(
        "[Engine] Run {} started{}",
        run_id,
        plan.as_deref().map(|p| format!(" ({})", p)).unwrap_or_default()
    );

    let executor = Executor {
        run_id: run_id.clone(),
        registry: inner.registry.clone(),
        invoker: inner.invoker.clone(),
        gates: inner.gates.clone(),
        progress: progress.clone(),
    };
    let started_at = Utc::now();
    let clock = Instant::now();
    let mut ctx = initial;
    let trace = executor
        .execute(root, ROOT_PATH.to_string(), &mut ctx, &cancel)
        .await;
    let duration_ms = clock.elapsed().as_millis() as u64;
    drop(run_guard);

    let status = WorkflowStatus::from(trace.status);
    match status {
        WorkflowStatus::Completed => {
            tracing::info!("[Engine] Run {} completed in {}ms", run_id, duration_ms)
        }
        _ => tracing::warn!(
            "[Engine] Run {} {} after {}ms: {}",
            run_id,
            status,
            duration_ms,
            trace
                .root_cause()
                .map(|e| e.message.as_str())
                .unwrap_or("no error recorded")
        ),
    }
    progress.publish(ProgressEvent::WorkflowFinished {
        run_id: run_id.clone(),
        status,
        duration_ms,
    });

    let (context, audit) = ctx.into_parts();
    WorkflowResult {
        run_id,
        plan,
        status,
        context,
        audit,
        trace,
        started_at,
        duration_ms,
    }
}

// ─── Handle ───────────────────────────────────────────────────────────────

/// A submitted run.
pub struct WorkflowHandle {
    run_id: String,
    cancel: CancellationToken,
    progress: Arc<ProgressHub>,
    gates: Arc<GateController>,
    finished: watch::Receiver<Option<WorkflowStatus>>,
    task: JoinHandle<WorkflowResult>,
}

impl WorkflowHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn status(&self) -> RunStatus {
        if let Some(status) = *self.finished.borrow() {
            return RunStatus::Finished(status);
        }
        if self.gates.pending_for_run(&self.run_id).is_empty() {
            RunStatus::Running
        } else {
            RunStatus::WaitingOnGate
        }
    }

    /// Request cancellation. Running nodes stop at their next suspension point.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!("[Engine] Run {} cancellation requested", self.run_id);
            self.cancel.cancel();
        }
    }

    /// Progress stream: frontier replay, then live events. Call again to restart.
    pub fn progress(&self) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        self.progress.subscribe()
    }

    /// Gates of this run currently waiting for a signal.
    pub fn pending_gates(&self) -> Vec<PendingGate> {
        self.gates.pending_for_run(&self.run_id)
    }

    /// Signal the gate at `path` (e.g. `root/2`), whether or not it was reached yet.
    pub fn resolve_gate(&self, path: &str, approved: bool) -> SignalOutcome {
        self.gates.resolve(&gate_id(&self.run_id, path), approved)
    }

    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<WorkflowResult, EngineError> {
        self.task
            .await
            .map_err(|e| EngineError::Internal(format!("workflow task failed: {}", e)))
    }
}
