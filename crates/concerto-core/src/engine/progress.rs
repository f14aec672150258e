//! Progress events for a running workflow.
//!
//! A subscription first replays the current frontier (nodes that have started
//! but not finished, plus gates waiting on them) and then follows live events.
//! Subscribing after the run finished yields only `WorkflowFinished`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::Stream;

use crate::error::ErrorRecord;
use crate::workflow::NodeKind;

use super::trace::{GateResolution, NodeStatus, WorkflowStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    NodeStarted {
        path: String,
        kind: NodeKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
    NodeFinished {
        path: String,
        status: NodeStatus,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorRecord>,
    },
    LoopIteration {
        path: String,
        iteration: u32,
    },
    GatePending {
        path: String,
        gate_id: String,
        name: String,
    },
    GateResolved {
        path: String,
        gate_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resolution: Option<GateResolution>,
    },
    WorkflowFinished {
        run_id: String,
        status: WorkflowStatus,
        duration_ms: u64,
    },
}

impl ProgressEvent {
    pub fn path(&self) -> Option<&str> {
        match self {
            ProgressEvent::NodeStarted { path, .. }
            | ProgressEvent::NodeFinished { path, .. }
            | ProgressEvent::LoopIteration { path, .. }
            | ProgressEvent::GatePending { path, .. }
            | ProgressEvent::GateResolved { path, .. } => Some(path),
            ProgressEvent::WorkflowFinished { .. } => None,
        }
    }
}

#[derive(Default)]
struct FrontierEntry {
    started: Option<ProgressEvent>,
    gate: Option<ProgressEvent>,
}

#[derive(Default)]
struct Frontier {
    running: BTreeMap<String, FrontierEntry>,
    finished: Option<ProgressEvent>,
}

impl Frontier {
    fn apply(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::NodeStarted { path, .. } => {
                self.running.entry(path.clone()).or_default().started = Some(event.clone());
            }
            ProgressEvent::GatePending { path, .. } => {
                self.running.entry(path.clone()).or_default().gate = Some(event.clone());
            }
            ProgressEvent::GateResolved { path, .. } => {
                if let Some(entry) = self.running.get_mut(path) {
                    entry.gate = None;
                }
            }
            ProgressEvent::NodeFinished { path, .. } => {
                self.running.remove(path);
            }
            ProgressEvent::LoopIteration { .. } => {}
            ProgressEvent::WorkflowFinished { .. } => {
                self.running.clear();
                self.finished = Some(event.clone());
            }
        }
    }

    fn replay(&self) -> Vec<ProgressEvent> {
        if let Some(finished) = &self.finished {
            return vec![finished.clone()];
        }
        // BTreeMap order puts parents before their children.
        self.running
            .values()
            .flat_map(|entry| entry.started.iter().chain(entry.gate.iter()))
            .cloned()
            .collect()
    }
}

/// Fan-out point for one run's progress events.
pub struct ProgressHub {
    tx: broadcast::Sender<ProgressEvent>,
    frontier: Mutex<Frontier>,
}

impl ProgressHub {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            tx,
            frontier: Mutex::new(Frontier::default()),
        })
    }

    fn frontier(&self) -> MutexGuard<'_, Frontier> {
        self.frontier
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn publish(&self, event: ProgressEvent) {
        let mut frontier = self.frontier();
        frontier.apply(&event);
        // No subscribers is fine; the frontier still tracks the event.
        let _ = self.tx.send(event);
    }

    pub fn is_finished(&self) -> bool {
        self.frontier().finished.is_some()
    }

    /// A fresh stream: frontier replay, then live events until the run finishes.
    pub fn subscribe(&self) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        // Snapshot and subscribe under one lock so no event is missed or repeated.
        let (replay, mut rx) = {
            let frontier = self.frontier();
            (frontier.replay(), self.tx.subscribe())
        };
        let already_finished = matches!(replay.last(), Some(ProgressEvent::WorkflowFinished { .. }));

        async_stream::stream! {
            for event in replay {
                yield event;
            }
            while !already_finished {
                match rx.recv().await {
                    Ok(event) => {
                        let done = matches!(event, ProgressEvent::WorkflowFinished { .. });
                        yield event;
                        if done {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("[Engine] Progress subscriber lagged, {} events dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}
