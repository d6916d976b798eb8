//! Five-step edge selection.
//!
//! After a node completes, exactly one outgoing edge is chosen by a fixed
//! priority cascade. The ordering is a hard contract: condition matches
//! always outrank label resolution, and label matches always outrank weight,
//! because conditions encode explicit author intent while labels and weights
//! are convenience defaults.
//!
//! 1. Edges whose guard condition evaluates true restrict the candidate set
//!    (edges with no condition are not eligible at this step); the winner
//!    among them is picked by step 4's weight/lexical rule.
//! 2. If the outcome carries a preferred label, the first edge in the full
//!    set whose normalized label matches wins.
//! 3. If the outcome suggests next node ids, the first edge targeting one of
//!    them (in suggestion order) wins.
//! 4. Among unconditional edges: highest weight, ties broken by the
//!    lexicographically smallest target id.
//! 5. Fallback: the weight/lexical rule over the full set.

use crate::condition::{evaluate_condition, parse_condition};
use crate::graph::{PipelineEdge, PipelineGraph};

/// Select the next edge after `node_id` completes. Returns `None` when the
/// node has no outgoing edges.
pub fn select_edge<'a>(
    node_id: &str,
    outcome: &trellis_types::Outcome,
    resolve: &dyn Fn(&str) -> String,
    graph: &'a PipelineGraph,
) -> Option<&'a PipelineEdge> {
    let edges = graph.outgoing_edges(node_id);
    if edges.is_empty() {
        return None;
    }

    // Step 1: condition matches.
    let matched = condition_matched(edges, resolve);
    if !matched.is_empty() {
        return Some(best_by_weight_then_target(&matched));
    }

    // Step 2: preferred label, matched against the full edge set.
    if let Some(label) = outcome.preferred_label.as_deref() {
        if !label.trim().is_empty() {
            let wanted = normalize_label(label);
            for edge in edges {
                if let Some(elabel) = edge.label.as_deref() {
                    if normalize_label(elabel) == wanted {
                        return Some(edge);
                    }
                }
            }
        }
    }

    // Step 3: suggested next ids, in suggestion order.
    for suggested in &outcome.suggested_next_ids {
        if let Some(edge) = edges.iter().find(|e| e.to == *suggested) {
            return Some(edge);
        }
    }

    // Step 4: unconditional edges by weight, lexical tiebreak.
    let unconditional: Vec<&PipelineEdge> =
        edges.iter().filter(|e| e.condition.is_none()).collect();
    if !unconditional.is_empty() {
        return Some(best_by_weight_then_target(&unconditional));
    }

    // Step 5: same rule over everything.
    let all: Vec<&PipelineEdge> = edges.iter().collect();
    Some(best_by_weight_then_target(&all))
}

/// Only step 1: edges whose guard condition evaluates true, best first by
/// the weight/lexical rule. Used where a failure may follow only an explicit
/// author-routed edge (e.g. out of a failed fan-out, whose unconditional
/// edges are branch entries, not failure routes).
pub fn select_condition_edge<'a>(
    node_id: &str,
    resolve: &dyn Fn(&str) -> String,
    graph: &'a PipelineGraph,
) -> Option<&'a PipelineEdge> {
    let matched = condition_matched(graph.outgoing_edges(node_id), resolve);
    if matched.is_empty() {
        None
    } else {
        Some(best_by_weight_then_target(&matched))
    }
}

/// Edges whose non-empty guard condition evaluates true. An empty condition
/// string parses to zero clauses (always true); it is not an explicit author
/// choice, so it is not eligible here.
fn condition_matched<'a>(
    edges: &'a [PipelineEdge],
    resolve: &dyn Fn(&str) -> String,
) -> Vec<&'a PipelineEdge> {
    edges
        .iter()
        .filter(|e| match e.condition.as_deref() {
            Some(cond) => match parse_condition(cond) {
                Ok(parsed) if !parsed.clauses.is_empty() => evaluate_condition(&parsed, resolve),
                _ => false,
            },
            None => false,
        })
        .collect()
}

/// Normalize a label for comparison: trim, lowercase, and strip a leading
/// accelerator marker (`[Y] `, `Y) `, `Y - `).
pub(crate) fn normalize_label(label: &str) -> String {
    let s = label.trim().to_lowercase();
    regex::Regex::new(r"^(?:\[\w\]\s*|\w\)\s*|\w\s*-\s+)")
        .unwrap()
        .replace(&s, "")
        .to_string()
}

/// Highest weight wins; ties break toward the lexicographically smallest
/// target id.
fn best_by_weight_then_target<'a>(edges: &[&'a PipelineEdge]) -> &'a PipelineEdge {
    edges
        .iter()
        .copied()
        .max_by(|a, b| a.weight.cmp(&b.weight).then(b.to.cmp(&a.to)))
        .expect("best_by_weight_then_target called with empty slice")
}
