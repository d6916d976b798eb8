//! Goal-gate enforcement.
//!
//! Nodes flagged `goal_gate=true` must reach success (or partial success)
//! before the pipeline is allowed to exit. When a gate is unsatisfied at a
//! terminal node, traversal jumps back to a retry target resolved through a
//! four-level fallback chain.

use std::collections::HashMap;

use trellis_types::{Outcome, TrellisError};

use crate::graph::{PipelineGraph, PipelineNode};

/// Result of scanning the visited goal gates.
#[derive(Debug)]
pub struct GoalGateResult {
    pub all_satisfied: bool,
    pub failed_node_id: Option<String>,
    pub retry_target: Option<String>,
}

/// Check all *visited* goal-gate nodes against their recorded outcomes.
/// Unvisited gates are not considered; conditional routing may legitimately
/// bypass them.
pub fn check_goal_gates(
    graph: &PipelineGraph,
    node_outcomes: &HashMap<String, Outcome>,
) -> GoalGateResult {
    // Deterministic scan order so the reported failing gate is stable.
    let mut visited: Vec<(&String, &Outcome)> = node_outcomes.iter().collect();
    visited.sort_by_key(|(id, _)| id.as_str());

    for (node_id, outcome) in visited {
        if let Some(node) = graph.node(node_id) {
            if node.goal_gate && !outcome.status.satisfies_gate() {
                return GoalGateResult {
                    all_satisfied: false,
                    failed_node_id: Some(node_id.clone()),
                    retry_target: resolve_retry_target(node, graph),
                };
            }
        }
    }
    GoalGateResult {
        all_satisfied: true,
        failed_node_id: None,
        retry_target: None,
    }
}

/// Retry-target lookup, in order: node `retry_target`, node
/// `fallback_retry_target`, graph `retry_target`, graph
/// `fallback_retry_target`.
fn resolve_retry_target(node: &PipelineNode, graph: &PipelineGraph) -> Option<String> {
    node.retry_target
        .clone()
        .or_else(|| node.fallback_retry_target.clone())
        .or_else(|| graph.string_attr("retry_target").map(String::from))
        .or_else(|| graph.string_attr("fallback_retry_target").map(String::from))
}

/// Enforce goal gates at a terminal node: unsatisfied with no retry target is
/// a run failure.
pub fn enforce_goal_gates(
    graph: &PipelineGraph,
    node_outcomes: &HashMap<String, Outcome>,
) -> Result<GoalGateResult, TrellisError> {
    let result = check_goal_gates(graph, node_outcomes);
    if !result.all_satisfied && result.retry_target.is_none() {
        return Err(TrellisError::GoalGateUnsatisfied {
            node: result.failed_node_id.unwrap_or_default(),
        });
    }
    Ok(result)
}
