//! Retry policy and backoff for node execution.
//!
//! Every node gets `max_attempts = max_retries + 1` handler invocations.
//! Thrown errors retry only when the pluggable `should_retry` predicate
//! accepts them; `Retry` outcomes retry while attempts remain, sleeping a
//! computed backoff first. Exhausted retries downgrade to partial success
//! when the node allows partial results, otherwise the node fails with a
//! max-retries-exceeded reason.

use std::collections::HashMap;
use std::time::Duration;

use trellis_types::{Outcome, Result, StageStatus, TrellisError};

use crate::graph::PipelineNode;

/// Predicate deciding whether a thrown error is worth retrying.
pub type ShouldRetry = dyn Fn(&TrellisError) -> bool + Send + Sync;

/// Default predicate: the error taxonomy's retryable bucket (rate limits,
/// timeouts, transient backend failures). Auth/validation/config errors never
/// retry.
pub fn default_should_retry(err: &TrellisError) -> bool {
    err.is_retryable()
}

/// Backoff schedule: `min(initial_delay * factor^(n-1), max_delay)` for
/// 1-indexed attempt `n`, optionally multiplied by a uniform jitter factor in
/// [0.5, 1.5] to avoid synchronized retries across concurrent branches.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    /// The standard schedule: 200ms initial, doubling, capped at 30s, no
    /// jitter.
    pub fn standard() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: false,
        }
    }

    /// Tighter schedule for fast-failing local work.
    pub fn aggressive() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            factor: 1.5,
            max_delay: Duration::from_secs(2),
            jitter: false,
        }
    }

    /// No delay between attempts (tests, dry runs).
    pub fn none() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            factor: 1.0,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Base delay before attempt `n` (1-indexed), without jitter.
    pub fn base_delay(&self, attempt: usize) -> Duration {
        let n = attempt.max(1) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.factor.powi(n - 1);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay before attempt `n`, with jitter applied when enabled.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let factor: f64 = rand::Rng::gen_range(&mut rand::thread_rng(), 0.5..1.5);
        Duration::from_millis((base.as_millis() as f64 * factor) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Execute `f` under the node's retry budget.
///
/// `counters` is the per-node persistent retry-counter map from the run
/// state; it survives checkpoints so retry budgets carry across resumes.
/// Success (full or partial) resets the node's counter; each `Retry` outcome
/// increments it. `Fail` and `Skipped` pass through unchanged. Errors the
/// predicate rejects, and retry exhaustion without `allow_partial`, surface
/// as `Err` for the engine to fold or abort.
pub async fn execute_with_retry<F, Fut>(
    f: F,
    node: &PipelineNode,
    policy: &RetryPolicy,
    counters: &mut HashMap<String, usize>,
    should_retry: &ShouldRetry,
) -> Result<Outcome>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<Outcome>>,
{
    let max_attempts = node.max_attempts();
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(outcome) => match outcome.status {
                StageStatus::Retry => {
                    *counters.entry(node.id.clone()).or_insert(0) += 1;
                    if attempt < max_attempts {
                        let delay = policy.delay_for_attempt(attempt);
                        tracing::info!(
                            node = %node.id,
                            attempt,
                            delay_ms = %delay.as_millis(),
                            "Handler requested retry"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    if node.allow_partial {
                        tracing::warn!(
                            node = %node.id,
                            attempts = attempt,
                            "Retries exhausted, downgrading to partial success"
                        );
                        return Ok(Outcome {
                            status: StageStatus::PartialSuccess,
                            ..outcome
                        });
                    }
                    return Err(TrellisError::RetriesExhausted {
                        node: node.id.clone(),
                        attempts: attempt,
                    });
                }
                StageStatus::Success | StageStatus::PartialSuccess => {
                    counters.remove(&node.id);
                    return Ok(outcome);
                }
                // Fail and Skipped are terminal for this node; no retries.
                StageStatus::Fail | StageStatus::Skipped => return Ok(outcome),
            },
            Err(e) if should_retry(&e) && attempt < max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    node = %node.id,
                    attempt,
                    delay_ms = %delay.as_millis(),
                    error = %e,
                    "Retryable error"
                );
                *counters.entry(node.id.clone()).or_insert(0) += 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
