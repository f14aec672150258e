//! `concerto plan` — validate and dry-run composition plans.

use concerto_core::workflow::{child_path, CompositionNode, GateCondition, ROOT_PATH};
use concerto_core::{
    Context, EngineConfig, NodeResult, NodeStatus, PlanDefinition, ProgressEvent, SignalOutcome,
    WorkflowResult, WorkflowStatus,
};
use tokio_stream::StreamExt;

use super::{fixture_engine, load_fixtures, print_json, truncate};

/// Options for `plan run`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Initial context as a JSON object
    pub context: Option<String>,
    /// Gate names to approve when reached
    pub approve: Vec<String>,
    /// Gate names to reject when reached
    pub reject: Vec<String>,
    pub config: EngineConfig,
}

impl RunOptions {
    fn decision_for(&self, gate: &str) -> Option<bool> {
        if self.approve.iter().any(|g| g == gate) {
            Some(true)
        } else if self.reject.iter().any(|g| g == gate) {
            Some(false)
        } else {
            None
        }
    }

    fn initial_context(&self) -> Result<Context, String> {
        let Some(raw) = &self.context else {
            return Ok(Context::new());
        };
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| format!("Invalid --context JSON: {}", e))?;
        if !value.is_object() {
            return Err("--context must be a JSON object".to_string());
        }
        Ok(Context::from_json(value))
    }
}

/// Validate a plan file against the contracts in a fixture file.
pub async fn validate(plan_file: &str, agents_file: &str) -> Result<(), String> {
    let plan = PlanDefinition::from_file(plan_file).map_err(|e| e.to_string())?;
    let (registry, _) = load_fixtures(agents_file)?;
    plan.validate(&registry)
        .map_err(|e| format!("Plan '{}' is invalid: {}", plan.name, e))?;

    println!("✅ Plan '{}' is valid", plan.name);
    println!("   Version: {}", plan.version);
    if let Some(description) = &plan.description {
        println!("   {}", description);
    }
    let mut lines = Vec::new();
    outline(&plan.root, ROOT_PATH, 1, &mut lines);
    for line in lines {
        println!("{}", line);
    }
    Ok(())
}

fn outline(node: &CompositionNode, path: &str, depth: usize, lines: &mut Vec<String>) {
    let indent = "   ".repeat(depth);
    match node {
        CompositionNode::Leaf(leaf) => lines.push(format!(
            "{}{} leaf {} → {}",
            indent,
            path,
            leaf.agent_ref(),
            leaf.output_key
        )),
        CompositionNode::Sequential { children } => {
            lines.push(format!("{}{} sequential ({} children)", indent, path, children.len()));
            for (i, child) in children.iter().enumerate() {
                outline(child, &child_path(path, i), depth + 1, lines);
            }
        }
        CompositionNode::Parallel {
            branches,
            failure_policy,
        } => {
            lines.push(format!(
                "{}{} parallel ({} branches, {:?})",
                indent,
                path,
                branches.len(),
                failure_policy
            ));
            for branch in branches {
                outline(&branch.node, &child_path(path, &branch.id), depth + 1, lines);
            }
        }
        CompositionNode::Loop {
            body,
            max_iterations,
            ..
        } => {
            lines.push(format!("{}{} loop (max {})", indent, path, max_iterations));
            outline(body, &child_path(path, "iter1"), depth + 1, lines);
        }
        CompositionNode::Coordinator { clusters, .. } => {
            lines.push(format!("{}{} coordinator ({} clusters)", indent, path, clusters.len()));
            for (id, cluster) in clusters {
                outline(cluster, &child_path(path, id), depth + 1, lines);
            }
        }
        CompositionNode::Gate(gate) => {
            let kind = match gate.condition {
                GateCondition::External => "external",
                GateCondition::When(_) => "conditional",
            };
            lines.push(format!(
                "{}{} gate '{}' ({}, {}ms, on timeout {:?})",
                indent, path, gate.name, kind, gate.timeout_ms, gate.on_timeout
            ));
        }
    }
}

/// Run a plan against fixture agents, answering gates from `--approve` / `--reject`.
///
/// Gates with no matching flag are left to their own timeout.
pub async fn execute(
    plan_file: &str,
    agents_file: &str,
    options: &RunOptions,
) -> Result<WorkflowResult, String> {
    if let Some(both) = options.approve.iter().find(|g| options.reject.contains(g)) {
        return Err(format!("Gate '{}' is both approved and rejected", both));
    }
    let plan = PlanDefinition::from_file(plan_file).map_err(|e| e.to_string())?;
    let initial = options.initial_context()?;
    let engine = fixture_engine(agents_file, options.config.clone())?;

    let handle = engine.submit(plan, initial).map_err(|e| e.to_string())?;
    tracing::info!("[Plan] Run {} submitted", handle.run_id());

    let mut events = Box::pin(handle.progress());
    while let Some(event) = events.next().await {
        match event {
            ProgressEvent::GatePending { gate_id, name, .. } => {
                match options.decision_for(&name) {
                    Some(approved) => {
                        let outcome = engine.resolve_gate(&gate_id, approved);
                        if outcome != SignalOutcome::Delivered {
                            tracing::warn!("[Plan] Signal for gate '{}' was {:?}", name, outcome);
                        }
                    }
                    None => tracing::info!(
                        "[Plan] Gate '{}' is waiting; no --approve/--reject given, it will time out",
                        name
                    ),
                }
            }
            ProgressEvent::LoopIteration { path, iteration } => {
                tracing::debug!("[Plan] {} iteration {}", path, iteration);
            }
            ProgressEvent::WorkflowFinished { status, .. } => {
                tracing::info!("[Plan] Run finished: {}", status);
            }
            _ => {}
        }
    }

    handle.wait().await.map_err(|e| e.to_string())
}

/// `concerto plan run`
pub async fn run(
    plan_file: &str,
    agents_file: &str,
    options: RunOptions,
    json: bool,
) -> Result<(), String> {
    let result = execute(plan_file, agents_file, &options).await?;

    if json {
        let value = serde_json::to_value(&result)
            .map_err(|e| format!("Failed to serialize result: {}", e))?;
        print_json(&value);
    } else {
        print_result(&result);
    }

    match result.status {
        WorkflowStatus::Completed => Ok(()),
        status => Err(format!(
            "Workflow {}: {}",
            status,
            result
                .trace
                .root_cause()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "no error recorded".to_string())
        )),
    }
}

fn print_result(result: &WorkflowResult) {
    println!(
        "📄 Run {} ({}) — {} in {}ms",
        result.run_id,
        result.plan.as_deref().unwrap_or("unnamed"),
        result.status,
        result.duration_ms
    );
    println!();
    print_node(&result.trace, 0);

    println!();
    println!("Context:");
    for (key, value) in &result.context {
        println!("   {} = {}", key, truncate(&value.to_string(), 60));
    }
}

fn print_node(node: &NodeResult, depth: usize) {
    let icon = match node.status {
        NodeStatus::Completed => "✅",
        NodeStatus::PartiallyCompleted => "⚠️",
        NodeStatus::Failed => "❌",
        NodeStatus::Cancelled => "🛑",
        NodeStatus::Skipped => "⏭",
    };
    let mut line = format!(
        "{}{} {} {:?}",
        "   ".repeat(depth),
        icon,
        node.path,
        node.kind
    );
    if let Some(label) = &node.label {
        line.push_str(&format!(" {}", label));
    }
    if let Some(attempts) = node.attempts {
        if attempts > 1 {
            line.push_str(&format!(" ({} attempts)", attempts));
        }
    }
    if let Some(iterations) = node.iterations {
        let cap = if node.exceeded { ", cap reached" } else { "" };
        line.push_str(&format!(" ({} iterations{})", iterations, cap));
    }
    if let Some(cluster) = &node.cluster {
        line.push_str(&format!(" → {}", cluster));
    }
    if let Some(resolution) = node.gate {
        line.push_str(&format!(" [{:?}]", resolution));
    }
    if node.status != NodeStatus::Skipped {
        line.push_str(&format!(" {}ms", node.duration_ms));
    }
    println!("{}", line);
    if let Some(error) = &node.error {
        if node.children.is_empty() {
            println!("{}   {}", "   ".repeat(depth), error.message);
        }
    }
    for child in &node.children {
        print_node(child, depth + 1);
    }
}
