//! Walks a composition tree against one run's context.
//!
//! The executor:
//! 1. Refuses to start any node once the run's token is cancelled
//! 2. Runs leaves through the leaf invoker and commits their output
//! 3. Runs parallel branches concurrently on forked contexts and merges them
//!    in declared order
//! 4. Suspends on gates through the gate controller
//! 5. Publishes start/finish events for every node it starts

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::context::{BranchView, Context};
use crate::error::{EngineError, ErrorKind, ErrorRecord};
use crate::gate::{gate_id, GateController, WaitOutcome};
use crate::invoker::LeafInvoker;
use crate::registry::{CapabilityRegistry, ShapeError};
use crate::workflow::{
    child_path, Branch, Classifier, ClusterId, CompositionNode, Condition, FailurePolicy,
    GateCondition, GateNode, LeafNode, OnTimeout,
};

use super::progress::{ProgressEvent, ProgressHub};
use super::trace::{GateResolution, NodeResult, NodeStatus};

pub(crate) struct Executor {
    pub(crate) run_id: String,
    pub(crate) registry: Arc<CapabilityRegistry>,
    pub(crate) invoker: Arc<LeafInvoker>,
    pub(crate) gates: Arc<GateController>,
    pub(crate) progress: Arc<ProgressHub>,
}

/// Mark a result as failed (or cancelled, for cancellation errors).
fn fail(result: &mut NodeResult, error: &EngineError) {
    result.status = if error.kind() == ErrorKind::Cancelled {
        NodeStatus::Cancelled
    } else {
        NodeStatus::Failed
    };
    result.error = Some(error.record());
}

/// Carry a child's outcome up to its parent.
fn adopt(result: &mut NodeResult, child: &NodeResult) {
    result.status = match child.status {
        NodeStatus::Skipped => NodeStatus::Cancelled,
        other => other,
    };
    result.error = child.error.clone();
}

impl Executor {
    pub(crate) fn execute<'a>(
        &'a self,
        node: &'a CompositionNode,
        path: String,
        ctx: &'a mut Context,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, NodeResult> {
        async move {
            let mut result = NodeResult::started(node, &path);
            if cancel.is_cancelled() {
                result.status = NodeStatus::Cancelled;
                result.error = Some(ErrorRecord::cancelled(format!("'{}' not started", path)));
                return result;
            }

            self.progress.publish(ProgressEvent::NodeStarted {
                path: path.clone(),
                kind: node.kind(),
                label: node.label(),
            });
            let clock = Instant::now();

            match node {
                CompositionNode::Leaf(leaf) => {
                    self.run_leaf(leaf, &path, ctx, cancel, &mut result).await
                }
                CompositionNode::Sequential { children } => {
                    self.run_sequential(children, &path, ctx, cancel, &mut result)
                        .await
                }
                CompositionNode::Parallel {
                    branches,
                    failure_policy,
                } => {
                    self.run_parallel(branches, *failure_policy, &path, ctx, cancel, &mut result)
                        .await
                }
                CompositionNode::Loop {
                    body,
                    stop_when,
                    max_iterations,
                } => {
                    self.run_loop(body, stop_when, *max_iterations, &path, ctx, cancel, &mut result)
                        .await
                }
                CompositionNode::Coordinator {
                    classifier,
                    clusters,
                } => {
                    self.run_coordinator(classifier, clusters, &path, ctx, cancel, &mut result)
                        .await
                }
                CompositionNode::Gate(gate) => {
                    self.run_gate(gate, &path, ctx, cancel, &mut result).await
                }
            }

            result.duration_ms = clock.elapsed().as_millis() as u64;
            if !result.status.is_success() {
                if let Some(error) = &result.error {
                    tracing::debug!("[Engine] {} {}: {}", path, result.status, error.message);
                }
            }
            self.progress.publish(ProgressEvent::NodeFinished {
                path,
                status: result.status,
                duration_ms: result.duration_ms,
                error: result.error.clone(),
            });
            result
        }
        .boxed()
    }

    async fn run_leaf(
        &self,
        leaf: &LeafNode,
        path: &str,
        ctx: &mut Context,
        cancel: &CancellationToken,
        result: &mut NodeResult,
    ) {
        let contract = match self.registry.resolve_ref(&leaf.agent_ref()) {
            Ok(contract) => contract,
            Err(e) => return fail(result, &e),
        };
        let input = match leaf.input.resolve(ctx, &leaf.agent) {
            Ok(input) => input,
            Err(e) => return fail(result, &e),
        };

        match self.invoker.invoke(&contract, input, cancel).await {
            Ok(invocation) => {
                result.attempts = Some(invocation.attempts);
                ctx.set(path, leaf.output_key.as_str(), invocation.output);
            }
            Err(failure) => {
                result.attempts = Some(failure.attempts);
                fail(result, &failure.error);
            }
        }
    }

    async fn run_sequential(
        &self,
        children: &[CompositionNode],
        path: &str,
        ctx: &mut Context,
        cancel: &CancellationToken,
        result: &mut NodeResult,
    ) {
        let mut stopped = false;
        let mut partial = false;
        for (i, child) in children.iter().enumerate() {
            let child_path = child_path(path, i);
            if stopped {
                result.children.push(NodeResult::skipped(child, &child_path));
                continue;
            }
            let child_result = self.execute(child, child_path, ctx, cancel).await;
            match child_result.status {
                NodeStatus::Completed => {}
                NodeStatus::PartiallyCompleted => partial = true,
                _ => {
                    adopt(result, &child_result);
                    stopped = true;
                }
            }
            result.children.push(child_result);
        }
        if !stopped && partial {
            result.status = NodeStatus::PartiallyCompleted;
        }
    }

    async fn run_parallel(
        &self,
        branches: &[Branch],
        policy: FailurePolicy,
        path: &str,
        ctx: &mut Context,
        cancel: &CancellationToken,
        result: &mut NodeResult,
    ) {
        let group = cancel.child_token();
        let mut views: Vec<BranchView> = branches.iter().map(|b| ctx.fork(&b.id)).collect();
        let mut outcomes: Vec<Option<NodeResult>> = vec![None; branches.len()];
        let mut abort_trigger: Option<usize> = None;

        {
            let group = &group;
            let mut running: FuturesUnordered<_> = branches
                .iter()
                .zip(views.iter_mut())
                .enumerate()
                .map(move |(i, (branch, view))| async move {
                    let branch_path = child_path(path, &branch.id);
                    let outcome = self
                        .execute(&branch.node, branch_path, view.context_mut(), group)
                        .await;
                    (i, outcome)
                })
                .collect();

            while let Some((i, outcome)) = running.next().await {
                if policy == FailurePolicy::AbortAll
                    && abort_trigger.is_none()
                    && !outcome.status.is_success()
                {
                    tracing::info!(
                        "[Engine] {} branch '{}' {}, cancelling siblings",
                        path,
                        branches[i].id,
                        outcome.status
                    );
                    abort_trigger = Some(i);
                    group.cancel();
                }
                outcomes[i] = Some(outcome);
            }
        }

        let outcomes: Vec<NodeResult> = outcomes.into_iter().flatten().collect();
        let succeeded: Vec<bool> = outcomes.iter().map(|o| o.status.is_success()).collect();
        let any_partial = outcomes
            .iter()
            .any(|o| o.status == NodeStatus::PartiallyCompleted);

        if let Some(trigger) = abort_trigger {
            // Nothing from any branch reaches the parent.
            let any_failed = outcomes.iter().any(|o| o.status == NodeStatus::Failed);
            result.status = if any_failed {
                NodeStatus::Failed
            } else {
                NodeStatus::Cancelled
            };
            result.error = outcomes
                .iter()
                .find(|o| o.status == NodeStatus::Failed)
                .or_else(|| outcomes.get(trigger))
                .and_then(|o| o.error.clone());
            result.children = outcomes;
            return;
        }

        for (view, ok) in views.into_iter().zip(&succeeded) {
            if *ok {
                ctx.merge_branch(view);
            }
        }

        let ok_count = succeeded.iter().filter(|ok| **ok).count();
        let first_failure = outcomes.iter().find(|o| !o.status.is_success());
        if let Some(failed) = first_failure {
            result.error = failed.error.clone();
            result.status = if cancel.is_cancelled() {
                NodeStatus::Cancelled
            } else if ok_count == 0 {
                NodeStatus::Failed
            } else {
                NodeStatus::PartiallyCompleted
            };
        } else if any_partial {
            result.status = NodeStatus::PartiallyCompleted;
        }
        result.children = outcomes;
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        &self,
        body: &CompositionNode,
        stop_when: &Condition,
        max_iterations: u32,
        path: &str,
        ctx: &mut Context,
        cancel: &CancellationToken,
        result: &mut NodeResult,
    ) {
        let mut iteration = 0u32;
        let mut partial = false;
        loop {
            if iteration >= max_iterations {
                tracing::info!(
                    "[Engine] {} reached max_iterations ({}) without its stop condition",
                    path,
                    max_iterations
                );
                result.exceeded = true;
                break;
            }
            iteration += 1;
            self.progress.publish(ProgressEvent::LoopIteration {
                path: path.to_string(),
                iteration,
            });
            let body_path = child_path(path, format!("iter{}", iteration));
            let body_result = self.execute(body, body_path, ctx, cancel).await;
            let status = body_result.status;
            if !status.is_success() {
                adopt(result, &body_result);
            }
            result.children.push(body_result);

            if !status.is_success() {
                break;
            }
            partial |= status == NodeStatus::PartiallyCompleted;
            if stop_when.evaluate(ctx) {
                break;
            }
        }
        result.iterations = Some(iteration);
        if result.status == NodeStatus::Completed && partial {
            result.status = NodeStatus::PartiallyCompleted;
        }
    }

    async fn run_coordinator(
        &self,
        classifier: &Classifier,
        clusters: &std::collections::BTreeMap<ClusterId, CompositionNode>,
        path: &str,
        ctx: &mut Context,
        cancel: &CancellationToken,
        result: &mut NodeResult,
    ) {
        let cluster = match self.classify(classifier, ctx, cancel, result).await {
            Ok(cluster) => cluster,
            Err(e) => return fail(result, &e),
        };
        let Some(node) = clusters.get(&cluster) else {
            return fail(
                result,
                &EngineError::UnknownCluster {
                    cluster: cluster.to_string(),
                },
            );
        };
        tracing::debug!("[Engine] {} routed to cluster '{}'", path, cluster);

        let cluster_path = child_path(path, &cluster);
        result.cluster = Some(cluster);
        let cluster_result = self.execute(node, cluster_path, ctx, cancel).await;
        if cluster_result.status != NodeStatus::Completed {
            adopt(result, &cluster_result);
        }
        result.children.push(cluster_result);
    }

    async fn classify(
        &self,
        classifier: &Classifier,
        ctx: &Context,
        cancel: &CancellationToken,
        result: &mut NodeResult,
    ) -> Result<ClusterId, EngineError> {
        match classifier {
            Classifier::Key(key) => match ctx.get(key) {
                Some(Value::String(id)) => Ok(ClusterId(id.clone())),
                Some(other) => Err(EngineError::UnknownCluster {
                    cluster: other.to_string(),
                }),
                None => Err(EngineError::MissingInput {
                    agent: "classifier".to_string(),
                    key: key.clone(),
                }),
            },
            Classifier::Custom(f) => Ok((f.0)(ctx)),
            Classifier::Agent(agent) => {
                let contract = self.registry.resolve_ref(&agent.agent_ref())?;
                let input = agent.input.resolve(ctx, &agent.agent)?;
                let invocation = match self.invoker.invoke(&contract, input, cancel).await {
                    Ok(invocation) => invocation,
                    Err(failure) => {
                        result.attempts = Some(failure.attempts);
                        return Err(failure.error);
                    }
                };
                result.attempts = Some(invocation.attempts);
                cluster_from_output(&agent.agent, invocation.output)
            }
        }
    }

    async fn run_gate(
        &self,
        gate: &GateNode,
        path: &str,
        ctx: &Context,
        cancel: &CancellationToken,
        result: &mut NodeResult,
    ) {
        if let GateCondition::When(condition) = &gate.condition {
            if condition.evaluate(ctx) {
                tracing::debug!("[Engine] Gate '{}' condition already holds", gate.name);
                result.gate = Some(GateResolution::PassedCondition);
                return;
            }
        }

        let id = gate_id(&self.run_id, path);
        let outcome = self
            .gates
            .wait(&id, &gate.name, gate.timeout(), cancel, || {
                self.progress.publish(ProgressEvent::GatePending {
                    path: path.to_string(),
                    gate_id: id.clone(),
                    name: gate.name.clone(),
                })
            })
            .await;
        let resolution = match outcome {
            WaitOutcome::Approved => Some(GateResolution::Approved),
            WaitOutcome::Rejected => {
                result.status = NodeStatus::Cancelled;
                result.error = Some(ErrorRecord::cancelled(format!(
                    "gate '{}' was rejected",
                    gate.name
                )));
                Some(GateResolution::Rejected)
            }
            WaitOutcome::TimedOut => match gate.on_timeout {
                OnTimeout::ProceedDefault => Some(GateResolution::TimedOutProceeded),
                OnTimeout::Cancel => {
                    result.status = NodeStatus::Cancelled;
                    result.error = Some(ErrorRecord::cancelled(format!(
                        "gate '{}' timed out after {}ms",
                        gate.name, gate.timeout_ms
                    )));
                    Some(GateResolution::TimedOutCancelled)
                }
            },
            WaitOutcome::Cancelled => {
                result.status = NodeStatus::Cancelled;
                result.error = Some(ErrorRecord::cancelled(format!(
                    "workflow cancelled while gate '{}' was pending",
                    gate.name
                )));
                None
            }
        };
        result.gate = resolution;
        self.progress.publish(ProgressEvent::GateResolved {
            path: path.to_string(),
            gate_id: id,
            resolution,
        });
    }
}

/// A classifier agent answers with a cluster name, or `{ "cluster": "<name>" }`.
fn cluster_from_output(agent: &str, output: Value) -> Result<ClusterId, EngineError> {
    let name = match &output {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("cluster").and_then(|v| v.as_str()).map(String::from),
        _ => None,
    };
    name.map(ClusterId).ok_or_else(|| EngineError::Validation {
        agent: agent.to_string(),
        source: ShapeError::Mismatch {
            path: "$".to_string(),
            expected: "cluster name or object with 'cluster'".to_string(),
            found: output.to_string(),
        },
    })
}
