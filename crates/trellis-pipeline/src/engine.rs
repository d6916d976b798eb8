//! Pipeline execution engine — the traversal loop.
//!
//! The top level is strictly sequential: exactly one node executes at a time,
//! and every routing decision is made against a single consistent context
//! snapshot. Concurrency exists only inside parallel fan-out, which the
//! executor orchestrates itself with isolated per-branch contexts.
//!
//! Per node the loop is: resolve handler, execute under the retry policy,
//! fold the outcome into the context, set the well-known `outcome` /
//! `preferred_label` keys, persist the status artifact and a checkpoint, then
//! select the next edge. Terminal nodes trigger goal-gate enforcement before
//! the run may finish.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use trellis_types::{Checkpoint, Context, Outcome, Result, StageStatus, TrellisError};

use crate::artifacts::{ArtifactStore, StatusArtifact};
use crate::backend::SESSION_PERSISTENT_KEY;
use crate::checkpoint::save_checkpoint;
use crate::edge_selection::{select_condition_edge, select_edge};
use crate::events::{EventEmitter, PipelineEvent};
use crate::goal_gate::enforce_goal_gates;
use crate::graph::{PipelineGraph, PipelineNode};
use crate::handler::HandlerRegistry;
use crate::handlers::parallel::{
    aggregate_outcome, BranchRecord, ErrorPolicy, JoinPolicy, DEFAULT_MAX_PARALLEL,
};
use crate::retry::{default_should_retry, execute_with_retry, RetryPolicy, ShouldRetry};
use crate::validation::validate_or_raise;

/// Safety bound on nodes executed inside a single parallel branch.
const MAX_BRANCH_STEPS: usize = 100;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Configuration for a pipeline run.
pub struct PipelineConfig {
    /// Parent directory for run state (checkpoints, artifacts, logs).
    pub logs_root: PathBuf,
    /// Backoff schedule applied around every handler invocation.
    pub retry_policy: RetryPolicy,
    /// Fan-out bound used when a parallel node does not set `max_parallel`.
    pub max_parallel: usize,
    /// Cooperative cancellation, checked at node boundaries.
    pub cancellation: CancellationToken,
    pub emitter: EventEmitter,
    /// Predicate deciding which thrown errors are retried.
    pub should_retry: Arc<ShouldRetry>,
}

impl PipelineConfig {
    pub fn new(logs_root: impl Into<PathBuf>) -> Self {
        Self {
            logs_root: logs_root.into(),
            retry_policy: RetryPolicy::standard(),
            max_parallel: DEFAULT_MAX_PARALLEL,
            cancellation: CancellationToken::new(),
            emitter: EventEmitter::default(),
            should_retry: Arc::new(default_should_retry),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("trellis-runs"))
    }
}

/// The result of a completed pipeline execution.
#[derive(Debug)]
pub struct PipelineResult {
    pub run_id: String,
    /// The final outcome (normally the exit node's).
    pub outcome: Outcome,
    pub completed_nodes: Vec<String>,
    pub node_outcomes: HashMap<String, Outcome>,
    pub final_context: HashMap<String, serde_json::Value>,
    pub run_dir: PathBuf,
}

/// The core pipeline executor. Owns a handler registry and drives traversal.
pub struct PipelineExecutor {
    registry: Arc<HandlerRegistry>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn attr_to_json(val: &trellis_dot::AttributeValue) -> serde_json::Value {
    match val {
        trellis_dot::AttributeValue::String(s) => serde_json::Value::String(s.clone()),
        trellis_dot::AttributeValue::Integer(i) => serde_json::json!(*i),
        trellis_dot::AttributeValue::Float(f) => serde_json::json!(*f),
        trellis_dot::AttributeValue::Boolean(b) => serde_json::Value::Bool(*b),
        trellis_dot::AttributeValue::Duration(d) => serde_json::json!(d.as_millis() as u64),
    }
}

fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Resolver for edge-condition keys: the outcome's well-known keys first,
/// then the context snapshot (with or without a `context.` prefix).
fn resolve_key(
    key: &str,
    outcome: &Outcome,
    snapshot: &HashMap<String, serde_json::Value>,
) -> String {
    match key {
        "outcome" => outcome.status.as_str().to_string(),
        "preferred_label" => outcome.preferred_label.clone().unwrap_or_default(),
        _ => {
            let bare = key.strip_prefix("context.").unwrap_or(key);
            snapshot
                .get(bare)
                .or_else(|| snapshot.get(key))
                .map(value_to_string)
                .unwrap_or_default()
        }
    }
}

async fn seed_context(context: &Context, graph: &PipelineGraph) {
    for (key, val) in &graph.attrs {
        context.set(key, attr_to_json(val)).await;
    }
}

/// Mutable traversal state; checkpointed after every node.
struct RunState {
    completed: Vec<String>,
    outcomes: HashMap<String, Outcome>,
    retries: HashMap<String, usize>,
    context: Context,
    restarts: usize,
}

impl RunState {
    fn fresh(context: Context) -> Self {
        Self {
            completed: Vec::new(),
            outcomes: HashMap::new(),
            retries: HashMap::new(),
            context,
            restarts: 0,
        }
    }
}

/// How a node was executed, for routing purposes. Built-in fan-out routes
/// differently: its unconditional edges are branch entries, not successors.
enum NodeExecution {
    Normal(Outcome),
    Forked {
        outcome: Outcome,
        fan_in: Option<String>,
    },
}

impl NodeExecution {
    fn outcome(&self) -> &Outcome {
        match self {
            NodeExecution::Normal(o) => o,
            NodeExecution::Forked { outcome, .. } => outcome,
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineExecutor
// ---------------------------------------------------------------------------

impl PipelineExecutor {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    /// Executor pre-loaded with the built-in handlers over `backend`.
    pub fn with_default_registry(backend: Arc<dyn crate::backend::TaskBackend>) -> Self {
        Self::new(crate::handler::default_registry(backend))
    }

    /// Run the pipeline from its start node.
    pub async fn run(
        &self,
        graph: &PipelineGraph,
        config: &PipelineConfig,
    ) -> Result<PipelineResult> {
        validate_or_raise(graph)?;

        let context = Context::new();
        seed_context(&context, graph).await;

        let start = graph.start_node().ok_or_else(|| {
            TrellisError::ValidationError("No start node found".into())
        })?;

        let run_id = uuid::Uuid::new_v4().to_string();
        self.drive(graph, config, run_id, start.id.clone(), RunState::fresh(context), false)
            .await
    }

    /// Resume a run from a checkpoint: restores context, completed nodes,
    /// and retry counters, then continues from the node following
    /// `current_node`. The first resumed node runs with session persistence
    /// degraded for exactly one hop (in-memory backend sessions cannot
    /// survive a process restart).
    pub async fn resume(
        &self,
        graph: &PipelineGraph,
        config: &PipelineConfig,
        checkpoint: Checkpoint,
    ) -> Result<PipelineResult> {
        validate_or_raise(graph)?;

        let context = Context::from_snapshot(checkpoint.context, checkpoint.logs);
        let state = RunState {
            completed: checkpoint.completed_nodes,
            outcomes: checkpoint.node_outcomes,
            retries: checkpoint.node_retries,
            context,
            restarts: 0,
        };

        let last = graph.node(&checkpoint.current_node).ok_or_else(|| {
            TrellisError::Other(format!(
                "Checkpoint node '{}' not found in graph",
                checkpoint.current_node
            ))
        })?;
        let last_outcome = state
            .outcomes
            .get(&last.id)
            .cloned()
            .unwrap_or_else(|| Outcome::success("resumed"));

        let run_id = uuid::Uuid::new_v4().to_string();

        if graph.is_terminal(last) {
            // The prior run checkpointed at the exit; nothing left to do.
            let final_context = state.context.snapshot().await;
            return Ok(PipelineResult {
                run_id,
                outcome: last_outcome,
                completed_nodes: state.completed,
                node_outcomes: state.outcomes,
                final_context,
                run_dir: config.logs_root.clone(),
            });
        }

        let snapshot = state.context.snapshot().await;
        let resolve = |key: &str| resolve_key(key, &last_outcome, &snapshot);
        let next_id = match select_edge(&last.id, &last_outcome, &resolve, graph) {
            Some(edge) => edge.to.clone(),
            None => {
                return Err(TrellisError::Other(format!(
                    "Cannot resume: node '{}' has no outgoing edge",
                    last.id
                )))
            }
        };

        tracing::info!(
            resumed_from = %last.id,
            next = %next_id,
            "Resuming pipeline with one degraded-fidelity hop"
        );
        self.drive(graph, config, run_id, next_id, state, true).await
    }

    /// The traversal loop proper.
    async fn drive(
        &self,
        graph: &PipelineGraph,
        config: &PipelineConfig,
        run_id: String,
        start_node_id: String,
        mut state: RunState,
        mut degraded_hop: bool,
    ) -> Result<PipelineResult> {
        let run_started = Instant::now();
        let mut run_dir = config.logs_root.join(&run_id);
        let mut artifacts = ArtifactStore::new(run_dir.join("artifacts"));

        config.emitter.emit(PipelineEvent::PipelineStarted {
            pipeline_name: graph.name.clone(),
            run_id: run_id.clone(),
        });

        let mut current: &PipelineNode = graph.node(&start_node_id).ok_or_else(|| {
            TrellisError::Other(format!("Node '{start_node_id}' not found"))
        })?;

        let final_outcome = loop {
            if config.cancellation.is_cancelled() {
                let err = TrellisError::Cancelled {
                    node: current.id.clone(),
                };
                config.emitter.emit(PipelineEvent::PipelineFailed {
                    pipeline_name: graph.name.clone(),
                    error: err.to_string(),
                });
                return Err(err);
            }

            // Terminal nodes: enforce goal gates before the run may finish.
            // An unsatisfied gate with no retry target anywhere fails here.
            if graph.is_terminal(current) {
                let gates = match enforce_goal_gates(graph, &state.outcomes) {
                    Ok(gates) => gates,
                    Err(err) => {
                        config.emitter.emit(PipelineEvent::GoalGateChecked {
                            node_id: current.id.clone(),
                            satisfied: false,
                        });
                        config.emitter.emit(PipelineEvent::PipelineFailed {
                            pipeline_name: graph.name.clone(),
                            error: err.to_string(),
                        });
                        return Err(err);
                    }
                };
                config.emitter.emit(PipelineEvent::GoalGateChecked {
                    node_id: current.id.clone(),
                    satisfied: gates.all_satisfied,
                });
                if !gates.all_satisfied {
                    if let Some(target) = gates.retry_target {
                        tracing::info!(
                            gate = %gates.failed_node_id.unwrap_or_default(),
                            retry_target = %target,
                            "Goal gate unsatisfied, rerouting"
                        );
                        current = graph.node(&target).ok_or_else(|| {
                            TrellisError::Other(format!("Retry target '{target}' not found"))
                        })?;
                        continue;
                    }
                }
            }

            // Execute the node.
            let stage_started = Instant::now();
            let execution = self
                .execute_node(current, graph, config, &mut state, &artifacts, degraded_hop)
                .await?;
            degraded_hop = false;
            let outcome = execution.outcome().clone();

            config.emitter.emit(PipelineEvent::StageCompleted {
                node_id: current.id.clone(),
                status: outcome.status.as_str().to_string(),
                duration_ms: stage_started.elapsed().as_millis() as u64,
            });

            // Record and fold into context.
            state.completed.push(current.id.clone());
            state.outcomes.insert(current.id.clone(), outcome.clone());
            state
                .context
                .apply_updates(outcome.context_updates.clone())
                .await;
            state
                .context
                .set(
                    "outcome",
                    serde_json::Value::String(outcome.status.as_str().to_string()),
                )
                .await;
            match outcome.preferred_label {
                Some(ref label) => {
                    state
                        .context
                        .set("preferred_label", serde_json::Value::String(label.clone()))
                        .await;
                }
                // A stale label from an earlier node must not drive routing.
                None => {
                    state.context.remove("preferred_label").await;
                }
            }
            state
                .context
                .append_log(format!(
                    "{}: {}",
                    current.id,
                    outcome.status.as_str()
                ))
                .await;

            self.write_status_artifact(current, &outcome, &artifacts).await?;
            self.write_checkpoint(current, &state, &run_dir, config).await?;

            if graph.is_terminal(current) {
                config.emitter.emit(PipelineEvent::PipelineCompleted {
                    pipeline_name: graph.name.clone(),
                    completed_nodes: state.completed.clone(),
                    duration_ms: run_started.elapsed().as_millis() as u64,
                });
                break outcome;
            }

            // Built-in fan-out routes specially: on success it jumps to the
            // discovered fan-in node (not a direct edge target), and on
            // failure only an explicit condition edge may route, since the
            // fork's unconditional edges lead back into the branches.
            if let NodeExecution::Forked { fan_in, .. } = &execution {
                if outcome.status.satisfies_gate() {
                    match fan_in {
                        Some(fan_in_id) => {
                            current = graph.node(fan_in_id).ok_or_else(|| {
                                TrellisError::Other(format!(
                                    "Fan-in node '{fan_in_id}' not found"
                                ))
                            })?;
                            continue;
                        }
                        // Branches dead-ended; nothing downstream to run.
                        None => break outcome,
                    }
                }
            }

            // Select the next edge.
            let snapshot = state.context.snapshot().await;
            let resolve = |key: &str| resolve_key(key, &outcome, &snapshot);
            let next_edge = match &execution {
                NodeExecution::Forked { .. } => {
                    select_condition_edge(&current.id, &resolve, graph)
                }
                NodeExecution::Normal(_) => select_edge(&current.id, &outcome, &resolve, graph),
            };
            match next_edge {
                Some(edge) => {
                    config.emitter.emit(PipelineEvent::EdgeSelected {
                        from_node: edge.from.clone(),
                        to_node: edge.to.clone(),
                        edge_label: edge.label.clone(),
                    });

                    if edge.loop_restart {
                        // Reset-and-retry semantics: relaunch traversal from
                        // the edge target with fresh state and a fresh
                        // checkpoint/log directory.
                        state.restarts += 1;
                        config.emitter.emit(PipelineEvent::PipelineRestarted {
                            pipeline_name: graph.name.clone(),
                            restart: state.restarts,
                            from_node: edge.to.clone(),
                        });
                        tracing::info!(
                            restart = state.restarts,
                            target = %edge.to,
                            "Restarting pipeline via loop_restart edge"
                        );

                        run_dir = config
                            .logs_root
                            .join(format!("{run_id}-restart-{}", state.restarts));
                        artifacts = ArtifactStore::new(run_dir.join("artifacts"));

                        let restarts = state.restarts;
                        let context = Context::new();
                        seed_context(&context, graph).await;
                        state = RunState::fresh(context);
                        state.restarts = restarts;
                    }

                    current = graph.node(&edge.to).ok_or_else(|| {
                        TrellisError::Other(format!("Edge target '{}' not found", edge.to))
                    })?;
                }
                None => {
                    if outcome.status == StageStatus::Fail {
                        let reason = outcome
                            .failure_reason
                            .clone()
                            .unwrap_or_else(|| "Handler failed with no outgoing edge".into());
                        let err = TrellisError::HandlerError {
                            handler: self.registry.resolve_type(current),
                            node: current.id.clone(),
                            message: reason,
                        };
                        config.emitter.emit(PipelineEvent::PipelineFailed {
                            pipeline_name: graph.name.clone(),
                            error: err.to_string(),
                        });
                        return Err(err);
                    }
                    // Dead end on a non-fail outcome terminates the run.
                    break outcome;
                }
            }
        };

        let final_context = state.context.snapshot().await;
        Ok(PipelineResult {
            run_id,
            outcome: final_outcome,
            completed_nodes: state.completed,
            node_outcomes: state.outcomes,
            final_context,
            run_dir,
        })
    }

    /// Execute one node: built-in fan-out for parallel nodes, otherwise the
    /// resolved handler under the retry policy. Handler errors are folded
    /// into FAIL outcomes here; only cancellation and structural errors
    /// abort the run.
    async fn execute_node(
        &self,
        node: &PipelineNode,
        graph: &PipelineGraph,
        config: &PipelineConfig,
        state: &mut RunState,
        artifacts: &ArtifactStore,
        degraded_hop: bool,
    ) -> Result<NodeExecution> {
        let handler_type = self.registry.resolve_type(node);
        config.emitter.emit(PipelineEvent::StageStarted {
            node_id: node.id.clone(),
            handler_type: handler_type.clone(),
        });

        if degraded_hop {
            state
                .context
                .set(SESSION_PERSISTENT_KEY, serde_json::Value::Bool(false))
                .await;
        }

        let result = if handler_type == "parallel" && !self.registry.has("parallel") {
            self.run_parallel(node, graph, config, state, artifacts)
                .await
                .map(|(outcome, fan_in)| NodeExecution::Forked { outcome, fan_in })
        } else {
            match self.registry.get(&handler_type) {
                Some(handler) => {
                    let ctx = state.context.clone();
                    let retries = &mut state.retries;
                    execute_with_retry(
                        || handler.execute(node, &ctx, graph, artifacts),
                        node,
                        &config.retry_policy,
                        retries,
                        config.should_retry.as_ref(),
                    )
                    .await
                    .map(NodeExecution::Normal)
                }
                None => Err(TrellisError::ConfigError(format!(
                    "No handler registered for type '{handler_type}' (node '{}')",
                    node.id
                ))),
            }
        };

        if degraded_hop {
            state.context.remove(SESSION_PERSISTENT_KEY).await;
        }

        match result {
            Ok(execution) => Ok(execution),
            Err(e @ TrellisError::Cancelled { .. }) => Err(e),
            Err(e) if e.is_structural() => Err(e),
            Err(e) => {
                // A handler crash must never crash the run.
                tracing::warn!(node = %node.id, error = %e, "Handler failed, folding into FAIL outcome");
                config.emitter.emit(PipelineEvent::StageFailed {
                    node_id: node.id.clone(),
                    error: e.to_string(),
                });
                Ok(NodeExecution::Normal(Outcome::fail(e.to_string())))
            }
        }
    }

    /// Built-in bounded fan-out over the parallel node's outgoing edges.
    /// Returns the aggregate outcome plus the fan-in node the branches
    /// converged on, if any.
    async fn run_parallel(
        &self,
        node: &PipelineNode,
        graph: &PipelineGraph,
        config: &PipelineConfig,
        state: &mut RunState,
        artifacts: &ArtifactStore,
    ) -> Result<(Outcome, Option<String>)> {
        let join = JoinPolicy::from_node(node)?;
        let error_policy = ErrorPolicy::from_node(node)?;
        let edges = graph.outgoing_edges(&node.id);
        if edges.is_empty() {
            return Ok((Outcome::fail("parallel node has no branches"), None));
        }

        let limit = node.max_parallel.unwrap_or(config.max_parallel).max(1);
        let semaphore = Arc::new(tokio::sync::Semaphore::new(limit));
        let branch_cancel = config.cancellation.child_token();
        let shared_graph = Arc::new(graph.clone());

        tracing::info!(
            node = %node.id,
            branches = edges.len(),
            limit,
            ?join,
            "Parallel fan-out"
        );

        let mut join_set = tokio::task::JoinSet::new();
        for edge in edges {
            let branch_name = edge.label.clone().unwrap_or_else(|| edge.to.clone());
            // Branch isolation: a deep copy, not a handle to the shared state.
            let branch_ctx = state.context.clone_isolated().await;
            let registry = Arc::clone(&self.registry);
            let shared_graph = Arc::clone(&shared_graph);
            let artifacts = artifacts.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = branch_cancel.clone();
            let policy = config.retry_policy.clone();
            let target = edge.to.clone();

            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                run_branch(
                    registry,
                    shared_graph,
                    artifacts,
                    branch_ctx,
                    target,
                    branch_name,
                    policy,
                    cancel,
                )
                .await
            });
        }

        let total = edges.len();
        let mut records: Vec<BranchRecord> = Vec::with_capacity(total);
        let mut fan_in: Option<String> = None;

        while let Some(joined) = join_set.join_next().await {
            let (record, branch_fan_in) = match joined {
                Ok(pair) => pair,
                Err(e) => (
                    BranchRecord {
                        branch: "unknown".into(),
                        node: node.id.clone(),
                        status: StageStatus::Fail,
                        score: None,
                        notes: format!("branch task panicked: {e}"),
                        context_updates: HashMap::new(),
                    },
                    None,
                ),
            };
            if fan_in.is_none() {
                fan_in = branch_fan_in;
            }

            config.emitter.emit(PipelineEvent::BranchCompleted {
                parent_node: node.id.clone(),
                branch: record.branch.clone(),
                status: record.status.as_str().to_string(),
            });

            let succeeded = record.status.satisfies_gate();
            let failed = record.status == StageStatus::Fail;
            records.push(record);

            if failed && error_policy == ErrorPolicy::FailFast {
                branch_cancel.cancel();
            }
            if succeeded && join == JoinPolicy::FirstSuccess {
                branch_cancel.cancel();
            }
        }

        let surfaced: Vec<BranchRecord> = match error_policy {
            ErrorPolicy::Ignore => records
                .into_iter()
                .filter(|r| r.status != StageStatus::Fail)
                .collect(),
            _ => records,
        };

        Ok((aggregate_outcome(&node.id, join, &surfaced, total), fan_in))
    }

    async fn write_status_artifact(
        &self,
        node: &PipelineNode,
        outcome: &Outcome,
        artifacts: &ArtifactStore,
    ) -> Result<()> {
        if !node.auto_status {
            return Ok(());
        }
        let status = StatusArtifact::from(outcome);
        let json = serde_json::to_string_pretty(&status)?;
        artifacts
            .write_file(&format!("{}.status.json", node.id), &json)
            .await?;
        Ok(())
    }

    async fn write_checkpoint(
        &self,
        node: &PipelineNode,
        state: &RunState,
        run_dir: &std::path::Path,
        config: &PipelineConfig,
    ) -> Result<()> {
        let checkpoint = Checkpoint {
            timestamp: chrono::Utc::now(),
            current_node: node.id.clone(),
            completed_nodes: state.completed.clone(),
            node_retries: state.retries.clone(),
            context: state.context.snapshot().await,
            logs: state.context.logs().await,
            node_outcomes: state.outcomes.clone(),
        };
        save_checkpoint(&checkpoint, run_dir).await?;
        config.emitter.emit(PipelineEvent::CheckpointSaved {
            node_id: node.id.clone(),
        });
        Ok(())
    }
}

/// Execute one fan-out branch: the sub-path from `start_id` until a fan-in
/// node, a dead end, or a failure. Returns the branch record plus the fan-in
/// node id it stopped at, if any.
#[allow(clippy::too_many_arguments)]
async fn run_branch(
    registry: Arc<HandlerRegistry>,
    graph: Arc<PipelineGraph>,
    artifacts: ArtifactStore,
    ctx: Context,
    start_id: String,
    branch_name: String,
    policy: RetryPolicy,
    cancel: CancellationToken,
) -> (BranchRecord, Option<String>) {
    let mut retries: HashMap<String, usize> = HashMap::new();
    let mut current_id = start_id;
    let mut last_node = current_id.clone();
    let mut last_outcome = Outcome::success("empty branch");

    for _ in 0..MAX_BRANCH_STEPS {
        if cancel.is_cancelled() {
            return (
                BranchRecord {
                    branch: branch_name,
                    node: last_node,
                    status: StageStatus::Skipped,
                    score: None,
                    notes: "branch cancelled".into(),
                    context_updates: HashMap::new(),
                },
                None,
            );
        }

        let node = match graph.node(&current_id) {
            Some(n) => n,
            None => {
                return (
                    BranchRecord {
                        branch: branch_name,
                        node: current_id.clone(),
                        status: StageStatus::Fail,
                        score: None,
                        notes: format!("branch target '{current_id}' not found"),
                        context_updates: HashMap::new(),
                    },
                    None,
                )
            }
        };

        let handler_type = registry.resolve_type(node);
        if handler_type == "parallel.fan_in" {
            // Stop before the fan-in; the parent executes it once.
            return (
                BranchRecord::from_outcome(&branch_name, &last_node, &last_outcome),
                Some(node.id.clone()),
            );
        }
        if graph.is_terminal(node) {
            break;
        }
        if handler_type == "parallel" {
            return (
                BranchRecord {
                    branch: branch_name,
                    node: node.id.clone(),
                    status: StageStatus::Fail,
                    score: None,
                    notes: "nested parallel fan-out is not supported".into(),
                    context_updates: HashMap::new(),
                },
                None,
            );
        }

        let outcome = match registry.get(&handler_type) {
            Some(handler) => {
                match execute_with_retry(
                    || handler.execute(node, &ctx, &graph, &artifacts),
                    node,
                    &policy,
                    &mut retries,
                    &default_should_retry,
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => Outcome::fail(e.to_string()),
                }
            }
            None => Outcome::fail(format!(
                "No handler registered for type '{handler_type}'"
            )),
        };

        // Branch-local context only; the parent never sees these directly.
        ctx.apply_updates(outcome.context_updates.clone()).await;
        ctx.set(
            "outcome",
            serde_json::Value::String(outcome.status.as_str().to_string()),
        )
        .await;

        last_node = node.id.clone();
        last_outcome = outcome;

        if last_outcome.status == StageStatus::Fail {
            break;
        }

        let snapshot = ctx.snapshot().await;
        let resolve = |key: &str| resolve_key(key, &last_outcome, &snapshot);
        match select_edge(&node.id, &last_outcome, &resolve, &graph) {
            Some(edge) => current_id = edge.to.clone(),
            None => break,
        }
    }

    (
        BranchRecord::from_outcome(&branch_name, &last_node, &last_outcome),
        None,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
