//! Runtime graph model built from the DOT AST.
//!
//! `PipelineGraph` is immutable once constructed; the engine and handlers only
//! read from it. Node and edge attributes are extracted into typed fields with
//! documented defaults; everything else stays available in `raw_attrs`.

use std::collections::HashMap;
use std::time::Duration;

use trellis_dot::{AttributeValue, DotGraph, EdgeDef, NodeDef};

/// Terminal-node ids recognized in addition to the Msquare shape.
const TERMINAL_IDS: &[&str] = &["exit", "end", "done"];

#[derive(Debug, Clone)]
pub struct PipelineGraph {
    pub name: String,
    /// The pipeline's declared goal (graph attribute `goal`), expanded into
    /// task prompts via the `${goal}` template variable.
    pub goal: String,
    pub attrs: HashMap<String, AttributeValue>,
    nodes: HashMap<String, PipelineNode>,
    edges: Vec<PipelineEdge>,
    /// Maps node id to (start, count) into the sorted `edges` vec. Edges are
    /// sorted by `from`, so each node's outgoing edges form one contiguous
    /// slice.
    adjacency: HashMap<String, (usize, usize)>,
}

#[derive(Debug, Clone)]
pub struct PipelineNode {
    pub id: String,
    pub label: String,
    pub shape: String,
    /// Explicit handler type (`type` attribute); overrides the shape mapping.
    pub node_type: Option<String>,
    pub prompt: Option<String>,
    pub max_retries: usize,
    pub goal_gate: bool,
    pub retry_target: Option<String>,
    pub fallback_retry_target: Option<String>,
    pub fidelity: Option<String>,
    pub timeout: Option<Duration>,
    /// When true the engine synthesizes the node's status artifact if the
    /// handler did not write one.
    pub auto_status: bool,
    /// When true, exhausted retries downgrade to partial success instead of
    /// failing.
    pub allow_partial: bool,
    /// Fan-out bound for parallel nodes; falls back to the run config.
    pub max_parallel: Option<usize>,
    pub join_policy: Option<String>,
    pub error_policy: Option<String>,
    pub join_k: Option<usize>,
    pub join_quorum: Option<f64>,
    /// Poll cadence for supervisor-loop nodes.
    pub poll_interval: Option<Duration>,
    /// Answer assumed when a human-gate question times out.
    pub default_choice: Option<String>,
    pub raw_attrs: HashMap<String, AttributeValue>,
}

impl PipelineNode {
    /// Total handler invocations allowed: `max_retries + 1`, minimum 1.
    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }

    pub fn string_attr(&self, key: &str) -> Option<&str> {
        self.raw_attrs.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineEdge {
    pub from: String,
    pub to: String,
    pub label: Option<String>,
    pub condition: Option<String>,
    pub weight: i32,
    pub fidelity: Option<String>,
    /// When set, following this edge terminates the current run and relaunches
    /// traversal from `to` with a fresh checkpoint/log directory.
    pub loop_restart: bool,
}

// --- attribute extraction helpers ---

fn string_attr(attrs: &HashMap<String, AttributeValue>, key: &str) -> Option<String> {
    attrs.get(key).and_then(|v| v.as_str().map(String::from))
}

fn bool_attr(attrs: &HashMap<String, AttributeValue>, key: &str) -> Option<bool> {
    attrs.get(key).and_then(|v| v.as_bool())
}

fn int_attr(attrs: &HashMap<String, AttributeValue>, key: &str) -> Option<i64> {
    attrs.get(key).and_then(|v| v.as_int())
}

fn float_attr(attrs: &HashMap<String, AttributeValue>, key: &str) -> Option<f64> {
    attrs.get(key).and_then(|v| v.as_float())
}

fn duration_attr(attrs: &HashMap<String, AttributeValue>, key: &str) -> Option<Duration> {
    attrs.get(key).and_then(|v| v.as_duration())
}

// --- conversions ---

fn build_node(
    id: &str,
    def: &NodeDef,
    graph_defaults: &HashMap<String, AttributeValue>,
    subgraph_defaults: Option<&HashMap<String, AttributeValue>>,
) -> PipelineNode {
    // Layer defaults: graph-level, then subgraph-level, then explicit attrs.
    let mut attrs = graph_defaults.clone();
    if let Some(sg) = subgraph_defaults {
        attrs.extend(sg.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    attrs.extend(def.attrs.iter().map(|(k, v)| (k.clone(), v.clone())));

    PipelineNode {
        id: id.to_string(),
        label: string_attr(&attrs, "label").unwrap_or_else(|| id.to_string()),
        shape: string_attr(&attrs, "shape").unwrap_or_else(|| "box".to_string()),
        node_type: string_attr(&attrs, "type"),
        prompt: string_attr(&attrs, "prompt"),
        max_retries: int_attr(&attrs, "max_retries").map(|v| v.max(0) as usize).unwrap_or(0),
        goal_gate: bool_attr(&attrs, "goal_gate").unwrap_or(false),
        retry_target: string_attr(&attrs, "retry_target"),
        fallback_retry_target: string_attr(&attrs, "fallback_retry_target"),
        fidelity: string_attr(&attrs, "fidelity"),
        timeout: duration_attr(&attrs, "timeout"),
        auto_status: bool_attr(&attrs, "auto_status").unwrap_or(true),
        allow_partial: bool_attr(&attrs, "allow_partial").unwrap_or(false),
        max_parallel: int_attr(&attrs, "max_parallel").map(|v| v.max(1) as usize),
        join_policy: string_attr(&attrs, "join_policy"),
        error_policy: string_attr(&attrs, "error_policy"),
        join_k: int_attr(&attrs, "join_k").map(|v| v.max(0) as usize),
        join_quorum: float_attr(&attrs, "join_quorum"),
        poll_interval: duration_attr(&attrs, "poll_interval"),
        default_choice: string_attr(&attrs, "default_choice"),
        raw_attrs: attrs,
    }
}

fn build_edge(def: &EdgeDef, edge_defaults: &HashMap<String, AttributeValue>) -> PipelineEdge {
    let mut attrs = edge_defaults.clone();
    attrs.extend(def.attrs.iter().map(|(k, v)| (k.clone(), v.clone())));

    PipelineEdge {
        from: def.from.clone(),
        to: def.to.clone(),
        label: string_attr(&attrs, "label"),
        condition: string_attr(&attrs, "condition"),
        weight: int_attr(&attrs, "weight").map(|v| v as i32).unwrap_or(0),
        fidelity: string_attr(&attrs, "fidelity"),
        loop_restart: bool_attr(&attrs, "loop_restart").unwrap_or(false),
    }
}

impl PipelineGraph {
    pub fn from_dot(graph: DotGraph) -> trellis_types::Result<Self> {
        let mut nodes = HashMap::new();
        let mut all_edges = Vec::new();

        for (id, def) in &graph.nodes {
            nodes.insert(id.clone(), build_node(id, def, &graph.node_defaults, None));
        }
        for sg in &graph.subgraphs {
            for (id, def) in &sg.nodes {
                nodes.insert(
                    id.clone(),
                    build_node(id, def, &graph.node_defaults, Some(&sg.node_defaults)),
                );
            }
        }

        for def in &graph.edges {
            all_edges.push(build_edge(def, &graph.edge_defaults));
        }
        for sg in &graph.subgraphs {
            let mut sg_defaults = graph.edge_defaults.clone();
            sg_defaults.extend(sg.edge_defaults.iter().map(|(k, v)| (k.clone(), v.clone())));
            for def in &sg.edges {
                all_edges.push(build_edge(def, &sg_defaults));
            }
        }

        // Sort edges by `from` so each node's outgoing edges are contiguous.
        all_edges.sort_by(|a, b| a.from.cmp(&b.from));

        let mut adjacency: HashMap<String, (usize, usize)> = HashMap::new();
        let mut i = 0;
        while i < all_edges.len() {
            let start = i;
            let from = all_edges[i].from.clone();
            while i < all_edges.len() && all_edges[i].from == from {
                i += 1;
            }
            adjacency.insert(from, (start, i - start));
        }

        let goal = string_attr(&graph.attrs, "goal").unwrap_or_default();

        Ok(PipelineGraph {
            name: graph.name,
            goal,
            attrs: graph.attrs,
            nodes,
            edges: all_edges,
            adjacency,
        })
    }

    /// The unique start node: shape `Mdiamond`, falling back to id
    /// `start`/`Start`.
    pub fn start_node(&self) -> Option<&PipelineNode> {
        self.nodes
            .values()
            .find(|n| n.shape == "Mdiamond")
            .or_else(|| self.nodes.get("start").or_else(|| self.nodes.get("Start")))
    }

    /// Whether this node terminates traversal: shape `Msquare` or a
    /// conventional terminal id.
    pub fn is_terminal(&self, node: &PipelineNode) -> bool {
        node.shape == "Msquare" || TERMINAL_IDS.contains(&node.id.as_str())
    }

    pub fn node(&self, id: &str) -> Option<&PipelineNode> {
        self.nodes.get(id)
    }

    pub fn outgoing_edges(&self, node_id: &str) -> &[PipelineEdge] {
        match self.adjacency.get(node_id) {
            Some(&(start, count)) => &self.edges[start..start + count],
            None => &[],
        }
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = &PipelineNode> {
        self.nodes.values()
    }

    pub fn all_edges(&self) -> &[PipelineEdge] {
        &self.edges
    }

    /// Graph-level string attribute lookup (used for retry targets and the
    /// goal).
    pub fn string_attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(|v| v.as_str())
    }
}
