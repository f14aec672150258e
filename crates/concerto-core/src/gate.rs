//! Pending external approvals.
//!
//! When execution reaches a gate node the engine registers a wait here and
//! suspends that branch. `resolve(gate_id, approved)` is the only way to wake it
//! besides the gate's own timeout or workflow cancellation.
//!
//! Gate ids are `"<run-id>:<node-path>"`, e.g. `"5f0c…:root/2"`. Because paths are
//! deterministic, a caller may resolve a gate before execution reaches it; the
//! decision is kept and applied on arrival.
//!
//! Signals are idempotent: only the first signal for a gate counts, later ones
//! (and signals arriving after a timeout) are reported as `AlreadyResolved`.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Build the id of the gate at `path` in run `run_id`.
pub fn gate_id(run_id: &str, path: &str) -> String {
    format!("{}:{}", run_id, path)
}

fn run_of(gate_id: &str) -> &str {
    gate_id.split_once(':').map(|(run, _)| run).unwrap_or(gate_id)
}

/// A gate currently waiting for a signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingGate {
    pub gate_id: String,
    pub run_id: String,
    pub name: String,
    pub registered_at: DateTime<Utc>,
}

/// What happened to a `resolve` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalOutcome {
    /// A waiting gate was woken
    Delivered,
    /// The gate has not been reached yet; the decision is kept for it
    Recorded,
    /// The gate already has a decision (or timed out); no-op
    AlreadyResolved,
    /// No active run owns this gate id; no-op
    UnknownRun,
}

/// How a wait ended, before the gate's timeout policy is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Approved,
    Rejected,
    TimedOut,
    Cancelled,
}

struct PendingEntry {
    info: PendingGate,
    tx: oneshot::Sender<bool>,
}

#[derive(Default)]
struct GateState {
    active_runs: HashSet<String>,
    pending: HashMap<String, PendingEntry>,
    /// Decisions for gates not reached yet
    early: HashMap<String, bool>,
    /// Gates that were woken, timed out or abandoned
    settled: HashSet<String>,
}

/// Abandons a still-pending gate if its waiter is dropped mid-wait.
struct PendingGuard<'a> {
    controller: &'a GateController,
    gate_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.controller.settle_without_signal(self.gate_id) {
            tracing::debug!("[Gate] {} dropped while waiting", self.gate_id);
        }
    }
}

enum Registration {
    Decided(bool),
    Waiting(oneshot::Receiver<bool>),
}

#[derive(Default)]
pub struct GateController {
    state: Mutex<GateState>,
}

impl GateController {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn begin_run(&self, run_id: &str) {
        self.state().active_runs.insert(run_id.to_string());
    }

    /// Forget everything about a finished run. Later signals for it are no-ops.
    pub(crate) fn end_run(&self, run_id: &str) {
        let mut state = self.state();
        state.active_runs.remove(run_id);
        state.pending.retain(|id, _| run_of(id) != run_id);
        state.early.retain(|id, _| run_of(id) != run_id);
        state.settled.retain(|id| run_of(id) != run_id);
    }

    /// Deliver an external decision for a gate.
    pub fn resolve(&self, gate_id: &str, approved: bool) -> SignalOutcome {
        let mut state = self.state();
        if !state.active_runs.contains(run_of(gate_id)) {
            tracing::warn!("[Gate] Signal for {} ignored: run is not active", gate_id);
            return SignalOutcome::UnknownRun;
        }
        if state.settled.contains(gate_id) || state.early.contains_key(gate_id) {
            tracing::debug!("[Gate] Duplicate signal for {} ignored", gate_id);
            return SignalOutcome::AlreadyResolved;
        }
        match state.pending.remove(gate_id) {
            Some(entry) => {
                state.settled.insert(gate_id.to_string());
                // The receiver only disappears once the waiter gave up, which
                // also removes the pending entry, so a send error cannot happen here.
                let _ = entry.tx.send(approved);
                tracing::info!(
                    "[Gate] {} ({}) {}",
                    entry.info.name,
                    gate_id,
                    if approved { "approved" } else { "rejected" }
                );
                SignalOutcome::Delivered
            }
            None => {
                state.early.insert(gate_id.to_string(), approved);
                tracing::info!("[Gate] Recorded early decision for {}", gate_id);
                SignalOutcome::Recorded
            }
        }
    }

    /// Gates currently waiting, oldest first.
    pub fn pending(&self) -> Vec<PendingGate> {
        let mut gates: Vec<PendingGate> = self
            .state()
            .pending
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        gates.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then(a.gate_id.cmp(&b.gate_id)));
        gates
    }

    pub fn pending_for_run(&self, run_id: &str) -> Vec<PendingGate> {
        self.pending()
            .into_iter()
            .filter(|g| g.run_id == run_id)
            .collect()
    }

    fn register(&self, gate_id: &str, name: &str) -> Registration {
        let mut state = self.state();
        if let Some(approved) = state.early.remove(gate_id) {
            state.settled.insert(gate_id.to_string());
            return Registration::Decided(approved);
        }
        let (tx, rx) = oneshot::channel();
        let info = PendingGate {
            gate_id: gate_id.to_string(),
            run_id: run_of(gate_id).to_string(),
            name: name.to_string(),
            registered_at: Utc::now(),
        };
        state.pending.insert(gate_id.to_string(), PendingEntry { info, tx });
        Registration::Waiting(rx)
    }

    /// Stop waiting on a gate. Returns false if a signal got there first.
    fn settle_without_signal(&self, gate_id: &str) -> bool {
        let mut state = self.state();
        let was_pending = state.pending.remove(gate_id).is_some();
        if was_pending {
            state.settled.insert(gate_id.to_string());
        }
        was_pending
    }

    /// Suspend until the gate is signalled, times out, or `cancel` fires.
    ///
    /// `on_pending` runs once the gate is registered and about to suspend; it is
    /// not called when an early decision is already waiting for the gate.
    pub async fn wait(
        &self,
        gate_id: &str,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        on_pending: impl FnOnce(),
    ) -> WaitOutcome {
        let from_signal = |approved: bool| {
            if approved {
                WaitOutcome::Approved
            } else {
                WaitOutcome::Rejected
            }
        };

        let mut rx = match self.register(gate_id, name) {
            Registration::Decided(approved) => return from_signal(approved),
            Registration::Waiting(rx) => rx,
        };
        let _guard = PendingGuard {
            controller: self,
            gate_id,
        };
        on_pending();
        tracing::info!("[Gate] {} waiting for a signal ({}ms timeout)", gate_id, timeout.as_millis());

        tokio::select! {
            biased;
            signal = &mut rx => match signal {
                Ok(approved) => from_signal(approved),
                Err(_) => WaitOutcome::Cancelled,
            },
            _ = cancel.cancelled() => {
                if self.settle_without_signal(gate_id) {
                    tracing::info!("[Gate] {} abandoned by cancellation", gate_id);
                }
                WaitOutcome::Cancelled
            }
            _ = tokio::time::sleep(timeout) => {
                if self.settle_without_signal(gate_id) {
                    tracing::info!("[Gate] {} timed out", gate_id);
                    WaitOutcome::TimedOut
                } else {
                    // A signal raced the timer and won; its value is already in the channel.
                    match rx.await {
                        Ok(approved) => from_signal(approved),
                        Err(_) => WaitOutcome::TimedOut,
                    }
                }
            }
        }
    }
}
