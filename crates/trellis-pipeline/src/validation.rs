//! Graph validation: lint rules and diagnostics.
//!
//! Structural problems (no start node, unreachable nodes, dangling edges,
//! malformed guard conditions) are caught here, before execution. The engine
//! runs [`validate_or_raise`] once per run; anything that still slips through
//! to runtime aborts the run instead of being patched over.

use std::collections::{HashSet, VecDeque};

use crate::condition::parse_condition;
use crate::graph::PipelineGraph;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node_id: Option<String>,
    pub edge: Option<(String, String)>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn is_start(id: &str, shape: &str) -> bool {
    shape == "Mdiamond" || id == "start" || id == "Start"
}

fn is_terminal(id: &str, shape: &str) -> bool {
    shape == "Msquare" || matches!(id, "exit" | "end" | "done")
}

const FIDELITY_PREFIXES: &[&str] = &["full", "truncate", "compact", "summary"];

fn is_valid_fidelity(val: &str) -> bool {
    let val = val.trim();
    if val.is_empty() {
        return false;
    }
    match val.split_once(':') {
        Some((prefix, _)) => FIDELITY_PREFIXES.contains(&prefix),
        None => FIDELITY_PREFIXES.contains(&val),
    }
}

/// Shapes whose nodes are expected to carry a prompt for the task backend.
fn is_task_shape(shape: &str) -> bool {
    matches!(shape, "box" | "note" | "cds")
}

fn diag(
    rule: &dyn LintRule,
    severity: Severity,
    message: String,
    node_id: Option<String>,
    edge: Option<(String, String)>,
    fix: Option<String>,
) -> Diagnostic {
    Diagnostic {
        rule: rule.name().into(),
        severity,
        message,
        node_id,
        edge,
        fix,
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct StartNodeRule;
impl LintRule for StartNodeRule {
    fn name(&self) -> &str {
        "start_node"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let starts: Vec<_> = graph
            .all_nodes()
            .filter(|n| is_start(&n.id, &n.shape))
            .collect();
        match starts.len() {
            0 => vec![diag(
                self,
                Severity::Error,
                "Pipeline has no start node (shape=Mdiamond or id start/Start)".into(),
                None,
                None,
                Some("Add a node with shape=\"Mdiamond\" or id=\"start\"".into()),
            )],
            1 => vec![],
            n => vec![diag(
                self,
                Severity::Error,
                format!(
                    "Pipeline has {n} start nodes: {}; expected exactly one",
                    starts
                        .iter()
                        .map(|s| s.id.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                None,
                None,
                Some("Remove extra start nodes so only one remains".into()),
            )],
        }
    }
}

struct TerminalNodeRule;
impl LintRule for TerminalNodeRule {
    fn name(&self) -> &str {
        "terminal_node"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        if graph.all_nodes().any(|n| is_terminal(&n.id, &n.shape)) {
            vec![]
        } else {
            vec![diag(
                self,
                Severity::Error,
                "Pipeline has no terminal node (shape=Msquare or id exit/end/done)".into(),
                None,
                None,
                Some("Add a node with shape=\"Msquare\" or id=\"done\"".into()),
            )]
        }
    }
}

struct ReachabilityRule;
impl LintRule for ReachabilityRule {
    fn name(&self) -> &str {
        "reachability"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let start_id = match graph.start_node() {
            Some(n) => n.id.clone(),
            None => return vec![], // StartNodeRule reports this.
        };

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(start_id.clone());
        queue.push_back(start_id);
        while let Some(current) = queue.pop_front() {
            for edge in graph.outgoing_edges(&current) {
                if visited.insert(edge.to.clone()) {
                    queue.push_back(edge.to.clone());
                }
            }
        }

        let mut unreachable: Vec<_> = graph
            .all_nodes()
            .map(|n| n.id.clone())
            .filter(|id| !visited.contains(id))
            .collect();
        unreachable.sort();

        unreachable
            .into_iter()
            .map(|id| {
                diag(
                    self,
                    Severity::Error,
                    format!("Node '{id}' is not reachable from the start node"),
                    Some(id.clone()),
                    None,
                    Some(format!("Add an edge leading to '{id}' or remove it")),
                )
            })
            .collect()
    }
}

struct EdgeTargetExistsRule;
impl LintRule for EdgeTargetExistsRule {
    fn name(&self) -> &str {
        "edge_target_exists"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .all_edges()
            .iter()
            .filter(|e| graph.node(&e.to).is_none())
            .map(|e| {
                diag(
                    self,
                    Severity::Error,
                    format!("Edge {} -> {} references non-existent target", e.from, e.to),
                    None,
                    Some((e.from.clone(), e.to.clone())),
                    Some(format!("Add node '{}' or fix the edge target", e.to)),
                )
            })
            .collect()
    }
}

struct StartNoIncomingRule;
impl LintRule for StartNoIncomingRule {
    fn name(&self) -> &str {
        "start_no_incoming"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let start = match graph.start_node() {
            Some(n) => n.id.clone(),
            None => return vec![],
        };
        if graph.all_edges().iter().any(|e| e.to == start) {
            vec![diag(
                self,
                Severity::Error,
                format!("Start node '{start}' has incoming edges"),
                Some(start),
                None,
                Some("Remove edges pointing to the start node".into()),
            )]
        } else {
            vec![]
        }
    }
}

struct ExitNoOutgoingRule;
impl LintRule for ExitNoOutgoingRule {
    fn name(&self) -> &str {
        "exit_no_outgoing"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .all_nodes()
            .filter(|n| is_terminal(&n.id, &n.shape))
            .filter(|n| !graph.outgoing_edges(&n.id).is_empty())
            .map(|n| {
                diag(
                    self,
                    Severity::Error,
                    format!("Terminal node '{}' has outgoing edges", n.id),
                    Some(n.id.clone()),
                    None,
                    Some(format!("Remove outgoing edges from '{}'", n.id)),
                )
            })
            .collect()
    }
}

struct ConditionSyntaxRule;
impl LintRule for ConditionSyntaxRule {
    fn name(&self) -> &str {
        "condition_syntax"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .all_edges()
            .iter()
            .filter_map(|e| {
                let cond = e.condition.as_deref()?;
                match parse_condition(cond) {
                    Ok(_) => None,
                    Err(err) => Some(diag(
                        self,
                        Severity::Error,
                        format!(
                            "Edge {} -> {} has invalid condition '{}': {}",
                            e.from, e.to, cond, err
                        ),
                        None,
                        Some((e.from.clone(), e.to.clone())),
                        Some("Fix the condition expression syntax".into()),
                    )),
                }
            })
            .collect()
    }
}

struct FidelityValidRule;
impl LintRule for FidelityValidRule {
    fn name(&self) -> &str {
        "fidelity_valid"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for node in graph.all_nodes() {
            if let Some(ref f) = node.fidelity {
                if !is_valid_fidelity(f) {
                    diags.push(diag(
                        self,
                        Severity::Warning,
                        format!("Node '{}' has invalid fidelity value '{f}'", node.id),
                        Some(node.id.clone()),
                        None,
                        Some("Use one of: full, truncate, compact, summary, summary:<level>".into()),
                    ));
                }
            }
        }
        for edge in graph.all_edges() {
            if let Some(ref f) = edge.fidelity {
                if !is_valid_fidelity(f) {
                    diags.push(diag(
                        self,
                        Severity::Warning,
                        format!(
                            "Edge {} -> {} has invalid fidelity value '{f}'",
                            edge.from, edge.to
                        ),
                        None,
                        Some((edge.from.clone(), edge.to.clone())),
                        Some("Use one of: full, truncate, compact, summary, summary:<level>".into()),
                    ));
                }
            }
        }
        diags
    }
}

struct RetryTargetExistsRule;
impl LintRule for RetryTargetExistsRule {
    fn name(&self) -> &str {
        "retry_target_exists"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for node in graph.all_nodes() {
            for (attr, target) in [
                ("retry_target", &node.retry_target),
                ("fallback_retry_target", &node.fallback_retry_target),
            ] {
                if let Some(target) = target {
                    if graph.node(target).is_none() {
                        diags.push(diag(
                            self,
                            Severity::Warning,
                            format!(
                                "Node '{}' has {attr} '{target}' which does not exist",
                                node.id
                            ),
                            Some(node.id.clone()),
                            None,
                            Some(format!("Add node '{target}' or fix {attr}")),
                        ));
                    }
                }
            }
        }
        diags
    }
}

struct GoalGateHasRetryRule;
impl LintRule for GoalGateHasRetryRule {
    fn name(&self) -> &str {
        "goal_gate_has_retry"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        // A graph-level retry target also covers the gate.
        let graph_fallback = graph.string_attr("retry_target").is_some()
            || graph.string_attr("fallback_retry_target").is_some();
        if graph_fallback {
            return vec![];
        }
        graph
            .all_nodes()
            .filter(|n| n.goal_gate && n.retry_target.is_none() && n.fallback_retry_target.is_none())
            .map(|n| {
                diag(
                    self,
                    Severity::Warning,
                    format!("Node '{}' has goal_gate=true but no retry_target", n.id),
                    Some(n.id.clone()),
                    None,
                    Some("Add a retry_target attribute so the goal gate can retry".into()),
                )
            })
            .collect()
    }
}

struct PromptOnTaskNodesRule;
impl LintRule for PromptOnTaskNodesRule {
    fn name(&self) -> &str {
        "prompt_on_task_nodes"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .all_nodes()
            .filter(|n| is_task_shape(&n.shape))
            .filter(|n| !is_start(&n.id, &n.shape) && !is_terminal(&n.id, &n.shape))
            .filter(|n| n.prompt.is_none() && n.label == n.id)
            .map(|n| {
                diag(
                    self,
                    Severity::Warning,
                    format!(
                        "Node '{}' (shape={}) has no prompt and label matches id",
                        n.id, n.shape
                    ),
                    Some(n.id.clone()),
                    None,
                    Some("Add a prompt or a descriptive label attribute".into()),
                )
            })
            .collect()
    }
}

struct ParallelPolicyRule;
impl LintRule for ParallelPolicyRule {
    fn name(&self) -> &str {
        "parallel_policy"
    }
    fn apply(&self, graph: &PipelineGraph) -> Vec<Diagnostic> {
        graph
            .all_nodes()
            .filter(|n| n.join_policy.is_some() || n.error_policy.is_some())
            .filter_map(|n| {
                let err = crate::handlers::parallel::JoinPolicy::from_node(n)
                    .err()
                    .or_else(|| crate::handlers::parallel::ErrorPolicy::from_node(n).err())?;
                Some(diag(
                    self,
                    Severity::Error,
                    format!("Node '{}' has an invalid fan-out policy: {err}", n.id),
                    Some(n.id.clone()),
                    None,
                    Some("Use join_policy wait_all/k_of_n/first_success/quorum and error_policy fail_fast/continue/ignore".into()),
                ))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(graph: &PipelineGraph) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(StartNodeRule),
        Box::new(TerminalNodeRule),
        Box::new(ReachabilityRule),
        Box::new(EdgeTargetExistsRule),
        Box::new(StartNoIncomingRule),
        Box::new(ExitNoOutgoingRule),
        Box::new(ConditionSyntaxRule),
        Box::new(FidelityValidRule),
        Box::new(RetryTargetExistsRule),
        Box::new(GoalGateHasRetryRule),
        Box::new(PromptOnTaskNodesRule),
        Box::new(ParallelPolicyRule),
    ];

    rules.iter().flat_map(|rule| rule.apply(graph)).collect()
}

/// Run all lint rules; `Err` if any Error-severity diagnostic was found.
pub fn validate_or_raise(graph: &PipelineGraph) -> trellis_types::Result<Vec<Diagnostic>> {
    let diagnostics = validate(graph);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.message.clone())
        .collect();
    if !errors.is_empty() {
        return Err(trellis_types::TrellisError::ValidationError(
            errors.join("; "),
        ));
    }
    Ok(diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(dot: &str) -> PipelineGraph {
        PipelineGraph::from_dot(trellis_dot::parse(dot).unwrap()).unwrap()
    }

    fn has(diags: &[Diagnostic], rule: &str, severity: Severity) -> bool {
        diags.iter().any(|d| d.rule == rule && d.severity == severity)
    }

    #[test]
    fn well_formed_pipeline_has_no_errors() {
        let pg = build(
            r#"digraph G {
                start [shape="Mdiamond"]
                work [label="Do work", prompt="Do the thing"]
                done [shape="Msquare"]
                start -> work -> done
            }"#,
        );
        let errors: Vec<_> = validate(&pg)
            .into_iter()
            .filter(|d| d.severity == Severity::Error)
            .collect();
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }

    #[test]
    fn missing_start_node() {
        let pg = build(
            r#"digraph G {
                work [prompt="p"]
                done [shape="Msquare"]
                work -> done
            }"#,
        );
        assert!(has(&validate(&pg), "start_node", Severity::Error));
    }

    #[test]
    fn multiple_start_nodes() {
        let pg = build(
            r#"digraph G {
                a [shape="Mdiamond"]
                b [shape="Mdiamond"]
                done [shape="Msquare"]
                a -> done
                b -> done
            }"#,
        );
        assert!(has(&validate(&pg), "start_node", Severity::Error));
    }

    #[test]
    fn missing_terminal_node() {
        let pg = build(
            r#"digraph G {
                start [shape="Mdiamond"]
                work [prompt="p"]
                start -> work
            }"#,
        );
        assert!(has(&validate(&pg), "terminal_node", Severity::Error));
    }

    #[test]
    fn unreachable_node() {
        let pg = build(
            r#"digraph G {
                start [shape="Mdiamond"]
                work [prompt="p"]
                orphan [prompt="lost"]
                done [shape="Msquare"]
                start -> work -> done
            }"#,
        );
        let diags = validate(&pg);
        assert!(diags
            .iter()
            .any(|d| d.rule == "reachability" && d.message.contains("orphan")));
    }

    #[test]
    fn start_with_incoming() {
        let pg = build(
            r#"digraph G {
                start [shape="Mdiamond"]
                work [prompt="p"]
                done [shape="Msquare"]
                start -> work -> done
                work -> start
            }"#,
        );
        assert!(has(&validate(&pg), "start_no_incoming", Severity::Error));
    }

    #[test]
    fn terminal_with_outgoing() {
        let pg = build(
            r#"digraph G {
                start [shape="Mdiamond"]
                done [shape="Msquare"]
                extra [prompt="p"]
                start -> done -> extra
            }"#,
        );
        assert!(has(&validate(&pg), "exit_no_outgoing", Severity::Error));
    }

    #[test]
    fn bad_condition_syntax() {
        let pg = build(
            r#"digraph G {
                start [shape="Mdiamond"]
                a [prompt="p"]
                done [shape="Msquare"]
                start -> a [condition="no_operator"]
                a -> done
            }"#,
        );
        assert!(has(&validate(&pg), "condition_syntax", Severity::Error));
    }

    #[test]
    fn invalid_fidelity_warns() {
        let pg = build(
            r#"digraph G {
                start [shape="Mdiamond"]
                a [prompt="p", fidelity="garbage"]
                done [shape="Msquare"]
                start -> a -> done
            }"#,
        );
        assert!(has(&validate(&pg), "fidelity_valid", Severity::Warning));
    }

    #[test]
    fn fidelity_values() {
        for ok in ["full", "truncate", "compact", "summary", "summary:low"] {
            assert!(is_valid_fidelity(ok), "{ok} should be valid");
        }
        assert!(!is_valid_fidelity("bogus"));
        assert!(!is_valid_fidelity(""));
        assert!(!is_valid_fidelity("bogus:low"));
    }

    #[test]
    fn missing_retry_target_warns() {
        let pg = build(
            r#"digraph G {
                start [shape="Mdiamond"]
                gate [prompt="p", goal_gate=true, retry_target="ghost"]
                done [shape="Msquare"]
                start -> gate -> done
            }"#,
        );
        assert!(has(&validate(&pg), "retry_target_exists", Severity::Warning));
    }

    #[test]
    fn goal_gate_without_any_retry_warns() {
        let pg = build(
            r#"digraph G {
                start [shape="Mdiamond"]
                gate [prompt="p", goal_gate=true]
                done [shape="Msquare"]
                start -> gate -> done
            }"#,
        );
        assert!(has(&validate(&pg), "goal_gate_has_retry", Severity::Warning));
    }

    #[test]
    fn graph_level_retry_target_quiets_goal_gate_rule() {
        let pg = build(
            r#"digraph G {
                retry_target = "start"
                start [shape="Mdiamond"]
                gate [prompt="p", goal_gate=true]
                done [shape="Msquare"]
                start -> gate -> done
            }"#,
        );
        assert!(!has(&validate(&pg), "goal_gate_has_retry", Severity::Warning));
    }

    #[test]
    fn bad_parallel_policy_is_an_error() {
        let pg = build(
            r#"digraph G {
                start [shape="Mdiamond"]
                fork [shape="component", join_policy="sometimes"]
                done [shape="Msquare"]
                start -> fork -> done
            }"#,
        );
        assert!(has(&validate(&pg), "parallel_policy", Severity::Error));
    }

    #[test]
    fn validate_or_raise_behaviour() {
        let good = build(
            r#"digraph G {
                start [shape="Mdiamond"]
                work [prompt="p"]
                done [shape="Msquare"]
                start -> work -> done
            }"#,
        );
        assert!(validate_or_raise(&good).is_ok());

        let bad = build(r#"digraph G { lonely [prompt="p"] }"#);
        assert!(validate_or_raise(&bad).is_err());
    }
}
