//! Leaf invoker: one validated, time-boxed, retried agent call.
//!
//! The invoker:
//! 1. Validates the input against the contract's input shape (no call on mismatch)
//! 2. Calls the agent through the transport, bounded by the contract timeout
//! 3. Retries timeouts and agent failures with capped exponential backoff,
//!    but only for idempotent agents
//! 4. Validates the output against the contract's output shape

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::registry::AgentContract;
use crate::transport::AgentTransport;

/// Exponential backoff between retries: `base * 2^(attempt-1)`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,
}

fn default_base_ms() -> u64 {
    100
}

fn default_cap_ms() -> u64 {
    5_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            cap_ms: default_cap_ms(),
        }
    }
}

impl BackoffConfig {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_ms.saturating_mul(factor).min(self.cap_ms))
    }
}

/// Successful call.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub output: Value,
    pub attempts: u32,
}

/// Failed call, with how many attempts were made (0 when rejected before calling).
#[derive(Debug, Clone)]
pub struct InvocationFailure {
    pub error: EngineError,
    pub attempts: u32,
}

pub struct LeafInvoker {
    transport: Arc<dyn AgentTransport>,
    backoff: BackoffConfig,
}

impl LeafInvoker {
    pub fn new(transport: Arc<dyn AgentTransport>, backoff: BackoffConfig) -> Self {
        Self { transport, backoff }
    }

    pub async fn invoke(
        &self,
        contract: &AgentContract,
        input: Value,
        cancel: &CancellationToken,
    ) -> Result<Invocation, InvocationFailure> {
        let fail = |error: EngineError, attempts: u32| InvocationFailure { error, attempts };

        contract
            .input_shape
            .validate(&input)
            .map_err(|source| {
                fail(
                    EngineError::Validation {
                        agent: contract.name.clone(),
                        source,
                    },
                    0,
                )
            })?;

        let agent = contract.agent_ref();
        let max_attempts = if contract.idempotent {
            contract.max_retries + 1
        } else {
            1
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(fail(
                    EngineError::Cancelled(format!("'{}' not started", agent)),
                    attempt - 1,
                ));
            }

            let call = tokio::time::timeout(
                contract.timeout(),
                self.transport.invoke(&agent, input.clone()),
            );
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("[Invoker] Abandoning in-flight call to {}", agent);
                    Err(EngineError::Cancelled(format!("call to '{}' abandoned", agent)))
                }
                outcome = call => match outcome {
                    Err(_) => Err(EngineError::Timeout {
                        agent: contract.name.clone(),
                        timeout_ms: contract.timeout_ms,
                    }),
                    Ok(Err(failure)) => Err(EngineError::Invocation {
                        agent: contract.name.clone(),
                        message: failure.message,
                    }),
                    Ok(Ok(output)) => contract
                        .output_shape
                        .validate(&output)
                        .map(|_| output)
                        .map_err(|source| EngineError::Validation {
                            agent: contract.name.clone(),
                            source,
                        }),
                },
            };

            let error = match result {
                Ok(output) => {
                    return Ok(Invocation {
                        output,
                        attempts: attempt,
                    })
                }
                Err(e) => e,
            };

            if !error.is_retryable() || attempt >= max_attempts {
                if error.is_retryable() && !contract.idempotent {
                    tracing::warn!(
                        "[Invoker] {} failed and is not idempotent, not retrying: {}",
                        agent,
                        error
                    );
                }
                return Err(fail(error, attempt));
            }

            let delay = self.backoff.delay(attempt);
            tracing::warn!(
                "[Invoker] {} attempt {}/{} failed: {} (retrying in {}ms)",
                agent,
                attempt,
                max_attempts,
                error,
                delay.as_millis()
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(fail(
                        EngineError::Cancelled(format!("retry of '{}' abandoned", agent)),
                        attempt,
                    ));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
