//! SupervisorLoopHandler — watches a child run (house nodes).
//!
//! The supervisor polls for a status artifact that the supervised child run
//! (or the tooling driving it) writes into the run's artifact directory.
//! Long waits are the reason this handler checks the cancellation token on
//! every tick: cooperative cancellation happens between node boundaries, so
//! a handler sitting in a poll loop must notice and return promptly.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use trellis_types::{Context, Outcome, Result, TrellisError};

use crate::artifacts::{ArtifactStore, StatusArtifact};
use crate::graph::{PipelineGraph, PipelineNode};
use crate::handler::NodeHandler;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_DEADLINE: Duration = Duration::from_secs(60);

pub struct SupervisorLoopHandler {
    cancel: CancellationToken,
}

impl SupervisorLoopHandler {
    /// Wire the handler to the run's cancellation token so in-progress polls
    /// stop when the run is cancelled.
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }
}

impl Default for SupervisorLoopHandler {
    fn default() -> Self {
        Self {
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl NodeHandler for SupervisorLoopHandler {
    fn handler_type(&self) -> &str {
        "supervisor.loop"
    }

    async fn execute(
        &self,
        node: &PipelineNode,
        _context: &Context,
        _graph: &PipelineGraph,
        artifacts: &ArtifactStore,
    ) -> Result<Outcome> {
        let status_file = node
            .string_attr("child_status_file")
            .map(String::from)
            .unwrap_or_else(|| format!("{}.child_status.json", node.id));
        let path = artifacts.root().join(&status_file);

        let interval = node.poll_interval.unwrap_or(DEFAULT_POLL_INTERVAL);
        let deadline = node.timeout.unwrap_or(DEFAULT_DEADLINE);
        let started = tokio::time::Instant::now();

        tracing::info!(
            node = %node.id,
            path = %path.display(),
            poll_ms = %interval.as_millis(),
            "Supervising child run"
        );

        loop {
            if self.cancel.is_cancelled() {
                return Err(TrellisError::Cancelled {
                    node: node.id.clone(),
                });
            }

            if tokio::fs::try_exists(&path).await? {
                let json = tokio::fs::read_to_string(&path).await?;
                return match serde_json::from_str::<StatusArtifact>(&json) {
                    Ok(status) => {
                        tracing::info!(node = %node.id, "Child run reported status");
                        Ok(status.into_outcome())
                    }
                    Err(e) => Ok(Outcome::fail(format!(
                        "Malformed child status artifact: {e}"
                    ))),
                };
            }

            if started.elapsed() >= deadline {
                // Bounded by the node's retry policy; nodes without one fail.
                return Ok(Outcome::retry("child run not finished before timeout"));
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(TrellisError::Cancelled { node: node.id.clone() });
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}
