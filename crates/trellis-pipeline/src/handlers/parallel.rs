//! Parallel fan-out policies and the fan-in handler.
//!
//! The executor forks branch execution itself (it owns the handler registry);
//! this module supplies the policy types it consults, the branch-result
//! record surfaced through the context, and the fan-in handler that ranks
//! surviving candidates.
//!
//! Join and error policies are orthogonal: the join policy decides whether
//! the fan-out as a whole succeeded, the error policy decides how sibling
//! branches react to a failure (`fail_fast` cancels them, `continue` lets
//! them run, `ignore` additionally drops failed results from the surfaced
//! set).

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use trellis_types::{Context, Outcome, Result, StageStatus, TrellisError};

use crate::artifacts::ArtifactStore;
use crate::backend::{BackendReply, TaskBackend};
use crate::graph::{PipelineGraph, PipelineNode};
use crate::handler::NodeHandler;

/// Context key under which the executor records fan-out results.
pub const PARALLEL_RESULTS_KEY: &str = "parallel.results";

/// Default in-flight bound when neither the node nor the config sets one.
pub const DEFAULT_MAX_PARALLEL: usize = 4;

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JoinPolicy {
    /// Success only if zero branches failed.
    WaitAll,
    /// Success once at least `k` branches succeeded.
    KOfN(usize),
    /// Success on the first successful branch; the executor cancels the rest.
    FirstSuccess,
    /// Success if the fraction of successful branches reaches the quorum.
    Quorum(f64),
}

impl JoinPolicy {
    pub fn from_node(node: &PipelineNode) -> Result<Self> {
        match node.join_policy.as_deref() {
            None | Some("wait_all") => Ok(JoinPolicy::WaitAll),
            Some("k_of_n") => {
                let k = node.join_k.ok_or_else(|| {
                    TrellisError::ConfigError(format!(
                        "node '{}': join_policy=k_of_n requires join_k",
                        node.id
                    ))
                })?;
                Ok(JoinPolicy::KOfN(k))
            }
            Some("first_success") => Ok(JoinPolicy::FirstSuccess),
            Some("quorum") => {
                let q = node.join_quorum.ok_or_else(|| {
                    TrellisError::ConfigError(format!(
                        "node '{}': join_policy=quorum requires join_quorum",
                        node.id
                    ))
                })?;
                if !(0.0..=1.0).contains(&q) {
                    return Err(TrellisError::ConfigError(format!(
                        "node '{}': join_quorum must be in [0, 1], got {q}",
                        node.id
                    )));
                }
                Ok(JoinPolicy::Quorum(q))
            }
            Some(other) => Err(TrellisError::ConfigError(format!(
                "node '{}': unknown join_policy '{other}'",
                node.id
            ))),
        }
    }

    /// Evaluate against final branch counts.
    pub fn satisfied(&self, successes: usize, failures: usize, total: usize) -> bool {
        match self {
            JoinPolicy::WaitAll => failures == 0 && total > 0,
            JoinPolicy::KOfN(k) => successes >= *k,
            JoinPolicy::FirstSuccess => successes >= 1,
            JoinPolicy::Quorum(q) => {
                total > 0 && (successes as f64) / (total as f64) >= *q
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Cancel sibling branches on the first failure.
    FailFast,
    /// Run every branch to completion regardless of failures.
    Continue,
    /// Like `Continue`, but failed branch results are dropped silently.
    Ignore,
}

impl ErrorPolicy {
    pub fn from_node(node: &PipelineNode) -> Result<Self> {
        match node.error_policy.as_deref() {
            None | Some("continue") => Ok(ErrorPolicy::Continue),
            Some("fail_fast") => Ok(ErrorPolicy::FailFast),
            Some("ignore") => Ok(ErrorPolicy::Ignore),
            Some(other) => Err(TrellisError::ConfigError(format!(
                "node '{}': unknown error_policy '{other}'",
                node.id
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Branch records
// ---------------------------------------------------------------------------

/// One branch's surfaced result, recorded under [`PARALLEL_RESULTS_KEY`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchRecord {
    /// Branch identity: the fan-out edge's label, or the first node's id.
    pub branch: String,
    /// The last node the branch executed.
    pub node: String,
    pub status: StageStatus,
    /// Optional ranking score, read from the branch outcome's `score` update.
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub context_updates: std::collections::HashMap<String, serde_json::Value>,
}

impl BranchRecord {
    pub fn from_outcome(branch: &str, node: &str, outcome: &Outcome) -> Self {
        let score = outcome
            .context_updates
            .get("score")
            .and_then(|v| v.as_f64());
        Self {
            branch: branch.to_string(),
            node: node.to_string(),
            status: outcome.status,
            score,
            notes: outcome.notes.clone(),
            context_updates: outcome.context_updates.clone(),
        }
    }
}

/// Build the aggregate fan-out outcome from the surfaced branch records.
pub fn aggregate_outcome(
    node_id: &str,
    join: JoinPolicy,
    records: &[BranchRecord],
    total_branches: usize,
) -> Outcome {
    let successes = records
        .iter()
        .filter(|r| r.status.satisfies_gate())
        .count();
    // Failures count against the join policy even when `ignore` dropped them
    // from the surfaced set.
    let failures = total_branches - successes;

    let results_json = serde_json::to_value(records).unwrap_or(serde_json::Value::Null);

    if join.satisfied(successes, failures, total_branches) {
        Outcome::success(format!(
            "Fan-out complete: {successes}/{total_branches} branches succeeded"
        ))
        .with_update(PARALLEL_RESULTS_KEY, results_json)
        .with_update(format!("{node_id}.branches"), serde_json::json!(total_branches))
    } else {
        let mut outcome = Outcome::fail(format!(
            "join policy unsatisfied: {successes}/{total_branches} branches succeeded"
        ));
        outcome
            .context_updates
            .insert(PARALLEL_RESULTS_KEY.to_string(), results_json);
        outcome
    }
}

// ---------------------------------------------------------------------------
// FanInHandler
// ---------------------------------------------------------------------------

/// Consumes the fan-out results recorded in the context and ranks the
/// surviving candidates: status rank first, then numeric score, then branch
/// id. When the node carries a prompt and a backend is available, ranking is
/// delegated to the backend instead; an unusable reply falls back to the
/// deterministic order. Fails only if every candidate failed.
pub struct FanInHandler {
    backend: Option<Arc<dyn TaskBackend>>,
}

impl FanInHandler {
    pub fn new(backend: Option<Arc<dyn TaskBackend>>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl NodeHandler for FanInHandler {
    fn handler_type(&self) -> &str {
        "parallel.fan_in"
    }

    async fn execute(
        &self,
        node: &PipelineNode,
        context: &Context,
        _graph: &PipelineGraph,
        _artifacts: &ArtifactStore,
    ) -> Result<Outcome> {
        let raw = context.get(PARALLEL_RESULTS_KEY).await.ok_or_else(|| {
            TrellisError::HandlerError {
                handler: "parallel.fan_in".into(),
                node: node.id.clone(),
                message: "no parallel results in context".into(),
            }
        })?;
        let records: Vec<BranchRecord> = serde_json::from_value(raw)?;

        if records.is_empty() {
            return Ok(Outcome::fail("fan-in reached with zero branch results"));
        }

        let mut candidates: Vec<&BranchRecord> = records
            .iter()
            .filter(|r| r.status != StageStatus::Fail)
            .collect();
        if candidates.is_empty() {
            return Ok(Outcome::fail("all parallel branches failed"));
        }

        candidates.sort_by(|a, b| {
            b.status
                .rank()
                .cmp(&a.status.rank())
                .then_with(|| {
                    b.score
                        .unwrap_or(0.0)
                        .partial_cmp(&a.score.unwrap_or(0.0))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.branch.cmp(&b.branch))
        });

        let winner = match (&self.backend, node.prompt.as_deref()) {
            (Some(backend), Some(prompt)) => {
                self.delegate_ranking(backend, node, prompt, context, &candidates)
                    .await
                    .unwrap_or(candidates[0])
            }
            _ => candidates[0],
        };

        tracing::info!(
            node = %node.id,
            winner = %winner.branch,
            candidates = candidates.len(),
            "Fan-in selected winner"
        );

        Ok(Outcome::success(format!(
            "Selected branch '{}' from {} candidates",
            winner.branch,
            candidates.len()
        ))
        .with_update("fan_in.winner", serde_json::json!(winner.branch))
        .with_update(
            "fan_in.winner_status",
            serde_json::json!(winner.status.as_str()),
        )
        .with_update("fan_in.result", serde_json::json!(winner.notes)))
    }
}

impl FanInHandler {
    /// Ask the backend to pick a winner; any reply that names no candidate
    /// yields `None`.
    async fn delegate_ranking<'a>(
        &self,
        backend: &Arc<dyn TaskBackend>,
        node: &PipelineNode,
        prompt: &str,
        context: &Context,
        candidates: &[&'a BranchRecord],
    ) -> Option<&'a BranchRecord> {
        let mut full = String::from(prompt);
        full.push_str("\n\nCandidates:\n");
        for c in candidates {
            full.push_str(&format!(
                "- {} (status {}): {}\n",
                c.branch,
                c.status.as_str(),
                c.notes
            ));
        }
        full.push_str("\nAnswer with the name of the winning candidate.");

        match backend.run(node, &full, context).await {
            Ok(BackendReply::Text(reply)) => {
                let lower = reply.to_lowercase();
                candidates
                    .iter()
                    .find(|c| lower.contains(&c.branch.to_lowercase()))
                    .copied()
            }
            Ok(BackendReply::Structured(_)) => None,
            Err(e) => {
                tracing::warn!(node = %node.id, error = %e, "Ranking delegation failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedBackend;
    use crate::graph::PipelineGraph;

    fn build(dot: &str) -> PipelineGraph {
        PipelineGraph::from_dot(trellis_dot::parse(dot).unwrap()).unwrap()
    }

    fn record(branch: &str, status: StageStatus, score: Option<f64>) -> BranchRecord {
        BranchRecord {
            branch: branch.to_string(),
            node: branch.to_string(),
            status,
            score,
            notes: format!("{branch} notes"),
            context_updates: Default::default(),
        }
    }

    async fn run_fan_in(
        handler: &FanInHandler,
        graph: &PipelineGraph,
        node_id: &str,
        records: &[BranchRecord],
    ) -> Outcome {
        let ctx = Context::new();
        ctx.set(
            PARALLEL_RESULTS_KEY,
            serde_json::to_value(records).unwrap(),
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        handler
            .execute(graph.node(node_id).unwrap(), &ctx, graph, &store)
            .await
            .unwrap()
    }

    // --- JoinPolicy ---

    #[test]
    fn join_policy_parsing() {
        let graph = build(
            r#"digraph G {
                a [join_policy="k_of_n", join_k=2]
                b [join_policy="quorum", join_quorum=0.5]
                c [join_policy="first_success"]
                d []
            }"#,
        );
        assert_eq!(
            JoinPolicy::from_node(graph.node("a").unwrap()).unwrap(),
            JoinPolicy::KOfN(2)
        );
        assert_eq!(
            JoinPolicy::from_node(graph.node("b").unwrap()).unwrap(),
            JoinPolicy::Quorum(0.5)
        );
        assert_eq!(
            JoinPolicy::from_node(graph.node("c").unwrap()).unwrap(),
            JoinPolicy::FirstSuccess
        );
        assert_eq!(
            JoinPolicy::from_node(graph.node("d").unwrap()).unwrap(),
            JoinPolicy::WaitAll
        );
    }

    #[test]
    fn join_policy_requires_parameters() {
        let graph = build(
            r#"digraph G {
                a [join_policy="k_of_n"]
                b [join_policy="quorum", join_quorum=1.5]
                c [join_policy="everyone"]
            }"#,
        );
        assert!(JoinPolicy::from_node(graph.node("a").unwrap()).is_err());
        assert!(JoinPolicy::from_node(graph.node("b").unwrap()).is_err());
        assert!(JoinPolicy::from_node(graph.node("c").unwrap()).is_err());
    }

    #[test]
    fn join_policy_satisfaction() {
        assert!(JoinPolicy::WaitAll.satisfied(3, 0, 3));
        assert!(!JoinPolicy::WaitAll.satisfied(2, 1, 3));

        assert!(JoinPolicy::KOfN(2).satisfied(2, 1, 3));
        assert!(!JoinPolicy::KOfN(2).satisfied(1, 2, 3));

        assert!(JoinPolicy::FirstSuccess.satisfied(1, 2, 3));
        assert!(!JoinPolicy::FirstSuccess.satisfied(0, 3, 3));

        assert!(JoinPolicy::Quorum(0.5).satisfied(2, 1, 3));
        assert!(!JoinPolicy::Quorum(0.75).satisfied(2, 1, 3));
    }

    #[test]
    fn error_policy_parsing() {
        let graph = build(
            r#"digraph G {
                a [error_policy="fail_fast"]
                b [error_policy="ignore"]
                c []
                d [error_policy="explode"]
            }"#,
        );
        assert_eq!(
            ErrorPolicy::from_node(graph.node("a").unwrap()).unwrap(),
            ErrorPolicy::FailFast
        );
        assert_eq!(
            ErrorPolicy::from_node(graph.node("b").unwrap()).unwrap(),
            ErrorPolicy::Ignore
        );
        assert_eq!(
            ErrorPolicy::from_node(graph.node("c").unwrap()).unwrap(),
            ErrorPolicy::Continue
        );
        assert!(ErrorPolicy::from_node(graph.node("d").unwrap()).is_err());
    }

    // --- aggregate_outcome ---

    #[test]
    fn aggregate_success_and_failure() {
        let records = vec![
            record("a", StageStatus::Success, None),
            record("b", StageStatus::Success, None),
        ];
        let ok = aggregate_outcome("fork", JoinPolicy::WaitAll, &records, 2);
        assert_eq!(ok.status, StageStatus::Success);
        assert!(ok.context_updates.contains_key(PARALLEL_RESULTS_KEY));

        let failed = vec![
            record("a", StageStatus::Success, None),
            record("b", StageStatus::Fail, None),
        ];
        let bad = aggregate_outcome("fork", JoinPolicy::WaitAll, &failed, 2);
        assert_eq!(bad.status, StageStatus::Fail);
        assert!(bad
            .failure_reason
            .unwrap()
            .contains("join policy unsatisfied"));
    }

    #[test]
    fn aggregate_counts_dropped_branches_against_join() {
        // `ignore` dropped one failed branch from the surfaced set; wait_all
        // must still see the failure.
        let surfaced = vec![record("a", StageStatus::Success, None)];
        let outcome = aggregate_outcome("fork", JoinPolicy::WaitAll, &surfaced, 2);
        assert_eq!(outcome.status, StageStatus::Fail);
    }

    // --- FanInHandler ---

    fn fan_in_graph() -> PipelineGraph {
        build(
            r#"digraph G {
                merge [shape="tripleoctagon"]
                merge -> next
            }"#,
        )
    }

    #[tokio::test]
    async fn fan_in_ranks_by_status_then_score_then_id() {
        let handler = FanInHandler::new(None);
        let graph = fan_in_graph();

        // Partial beats fail; success beats partial; higher score wins among
        // equals; id breaks the remaining tie.
        let records = vec![
            record("zeta", StageStatus::Success, Some(1.0)),
            record("alpha", StageStatus::Success, Some(1.0)),
            record("best", StageStatus::Success, Some(9.0)),
            record("partial", StageStatus::PartialSuccess, Some(99.0)),
            record("broken", StageStatus::Fail, None),
        ];
        let outcome = run_fan_in(&handler, &graph, "merge", &records).await;

        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(
            outcome.context_updates.get("fan_in.winner"),
            Some(&serde_json::json!("best"))
        );
    }

    #[tokio::test]
    async fn fan_in_tie_breaks_lexically() {
        let handler = FanInHandler::new(None);
        let graph = fan_in_graph();
        let records = vec![
            record("zeta", StageStatus::Success, None),
            record("alpha", StageStatus::Success, None),
        ];
        let outcome = run_fan_in(&handler, &graph, "merge", &records).await;
        assert_eq!(
            outcome.context_updates.get("fan_in.winner"),
            Some(&serde_json::json!("alpha"))
        );
    }

    #[tokio::test]
    async fn fan_in_fails_only_when_all_candidates_failed() {
        let handler = FanInHandler::new(None);
        let graph = fan_in_graph();

        let records = vec![
            record("a", StageStatus::Fail, None),
            record("b", StageStatus::Fail, None),
        ];
        let outcome = run_fan_in(&handler, &graph, "merge", &records).await;
        assert_eq!(outcome.status, StageStatus::Fail);
        assert!(outcome
            .failure_reason
            .unwrap()
            .contains("all parallel branches failed"));
    }

    #[tokio::test]
    async fn fan_in_without_results_errors() {
        let handler = FanInHandler::new(None);
        let graph = fan_in_graph();
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());

        let err = handler
            .execute(graph.node("merge").unwrap(), &Context::new(), &graph, &store)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no parallel results"));
    }

    #[tokio::test]
    async fn fan_in_delegates_ranking_to_backend_when_prompted() {
        let backend = Arc::new(ScriptedBackend::new().script(
            "merge",
            vec![Ok(BackendReply::Text(
                "The strongest candidate is zeta.".into(),
            ))],
        ));
        let handler = FanInHandler::new(Some(backend));
        let graph = build(
            r#"digraph G {
                merge [shape="tripleoctagon", prompt="Pick the best result"]
                merge -> next
            }"#,
        );
        let records = vec![
            record("alpha", StageStatus::Success, Some(5.0)),
            record("zeta", StageStatus::Success, Some(1.0)),
        ];
        let outcome = run_fan_in(&handler, &graph, "merge", &records).await;
        assert_eq!(
            outcome.context_updates.get("fan_in.winner"),
            Some(&serde_json::json!("zeta"))
        );
    }

    #[tokio::test]
    async fn fan_in_falls_back_when_backend_reply_names_nobody() {
        let backend = Arc::new(ScriptedBackend::new().script(
            "merge",
            vec![Ok(BackendReply::Text("no idea".into()))],
        ));
        let handler = FanInHandler::new(Some(backend));
        let graph = build(
            r#"digraph G {
                merge [shape="tripleoctagon", prompt="Pick"]
                merge -> next
            }"#,
        );
        let records = vec![
            record("alpha", StageStatus::Success, Some(5.0)),
            record("zeta", StageStatus::Success, Some(1.0)),
        ];
        let outcome = run_fan_in(&handler, &graph, "merge", &records).await;
        // Deterministic order: alpha has the higher score.
        assert_eq!(
            outcome.context_updates.get("fan_in.winner"),
            Some(&serde_json::json!("alpha"))
        );
    }
}
