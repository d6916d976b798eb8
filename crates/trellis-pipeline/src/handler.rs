//! Node handler trait, dynamic dispatch wrapper, and handler registry.
//!
//! Handler resolution for a node runs in three steps: an explicit `type`
//! attribute, then the shape mapping, then the default task handler.
//! Registering a type that already has a handler replaces it (last
//! registration wins) — that is how custom node types are added without
//! touching the engine.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use trellis_types::{Context, Outcome, Result};

use crate::artifacts::ArtifactStore;
use crate::backend::TaskBackend;
use crate::graph::{PipelineGraph, PipelineNode};

// ---------------------------------------------------------------------------
// NodeHandler trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// The handler type identifier (e.g. "start", "exit", "task").
    fn handler_type(&self) -> &str;

    /// Execute this handler for a node.
    ///
    /// Handlers must be safe to invoke repeatedly (the retry policy may call
    /// them several times) and must not assume exclusive ownership of shared
    /// state. Errors returned here are folded into `FAIL` outcomes at the
    /// engine boundary; they never crash the run.
    async fn execute(
        &self,
        node: &PipelineNode,
        context: &Context,
        graph: &PipelineGraph,
        artifacts: &ArtifactStore,
    ) -> Result<Outcome>;
}

// ---------------------------------------------------------------------------
// DynHandler — object-safe wrapper
// ---------------------------------------------------------------------------

pub struct DynHandler(Box<dyn NodeHandler>);

impl DynHandler {
    pub fn new(handler: impl NodeHandler + 'static) -> Self {
        Self(Box::new(handler))
    }

    pub fn handler_type(&self) -> &str {
        self.0.handler_type()
    }

    pub async fn execute(
        &self,
        node: &PipelineNode,
        context: &Context,
        graph: &PipelineGraph,
        artifacts: &ArtifactStore,
    ) -> Result<Outcome> {
        self.0.execute(node, context, graph, artifacts).await
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

pub struct HandlerRegistry {
    handlers: HashMap<String, DynHandler>,
    shape_to_type: HashMap<String, String>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        let mut shape_to_type = HashMap::new();
        shape_to_type.insert("Mdiamond".into(), "start".into());
        shape_to_type.insert("Msquare".into(), "exit".into());
        shape_to_type.insert("box".into(), "task".into());
        shape_to_type.insert("diamond".into(), "conditional".into());
        shape_to_type.insert("hexagon".into(), "human.gate".into());
        shape_to_type.insert("component".into(), "parallel".into());
        shape_to_type.insert("tripleoctagon".into(), "parallel.fan_in".into());
        shape_to_type.insert("parallelogram".into(), "tool".into());
        shape_to_type.insert("house".into(), "supervisor.loop".into());

        Self {
            handlers: HashMap::new(),
            shape_to_type,
        }
    }

    /// Register a handler; replaces any prior handler of the same type.
    pub fn register(&mut self, handler: impl NodeHandler + 'static) {
        let t = handler.handler_type().to_string();
        self.handlers.insert(t, DynHandler::new(handler));
    }

    /// Resolve a node to its handler type: explicit `type` attribute, then
    /// shape mapping, then the default `"task"`.
    ///
    /// A conditional node that carries a prompt resolves to `"task"` — its
    /// branching question needs the backend to actually run; the pass-through
    /// `ConditionalHandler` only covers pure routing nodes.
    pub fn resolve_type(&self, node: &PipelineNode) -> String {
        let resolved = node
            .node_type
            .clone()
            .or_else(|| self.shape_to_type.get(&node.shape).cloned())
            .unwrap_or_else(|| "task".to_string());
        if resolved == "conditional" && node.prompt.is_some() {
            return "task".to_string();
        }
        resolved
    }

    pub fn get(&self, handler_type: &str) -> Option<&DynHandler> {
        self.handlers.get(handler_type)
    }

    pub fn has(&self, handler_type: &str) -> bool {
        self.handlers.contains_key(handler_type)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Built-in no-op handlers
// ---------------------------------------------------------------------------

pub struct StartHandler;

#[async_trait]
impl NodeHandler for StartHandler {
    fn handler_type(&self) -> &str {
        "start"
    }

    async fn execute(
        &self,
        _node: &PipelineNode,
        _ctx: &Context,
        _graph: &PipelineGraph,
        _artifacts: &ArtifactStore,
    ) -> Result<Outcome> {
        Ok(Outcome::success("Pipeline started"))
    }
}

pub struct ExitHandler;

#[async_trait]
impl NodeHandler for ExitHandler {
    fn handler_type(&self) -> &str {
        "exit"
    }

    // Goal gates are evaluated by the engine before this handler runs; exit
    // itself stays a no-op so routing logic lives in one inspectable place.
    async fn execute(
        &self,
        _node: &PipelineNode,
        _ctx: &Context,
        _graph: &PipelineGraph,
        _artifacts: &ArtifactStore,
    ) -> Result<Outcome> {
        Ok(Outcome::success("Pipeline completed"))
    }
}

pub struct ConditionalHandler;

#[async_trait]
impl NodeHandler for ConditionalHandler {
    fn handler_type(&self) -> &str {
        "conditional"
    }

    // Branching is entirely the edge selector's job, reading guard
    // conditions; this keeps it declarative and out of handler code.
    async fn execute(
        &self,
        _node: &PipelineNode,
        _ctx: &Context,
        _graph: &PipelineGraph,
        _artifacts: &ArtifactStore,
    ) -> Result<Outcome> {
        Ok(Outcome::success("Conditional pass-through"))
    }
}

// ---------------------------------------------------------------------------
// Default registry factories
// ---------------------------------------------------------------------------

/// Registry with all built-in handlers wired to the given backend. Parallel
/// fan-out is orchestrated by the executor itself and needs no entry here;
/// registering a custom `"parallel"` handler overrides the built-in fork.
pub fn default_registry(backend: Arc<dyn TaskBackend>) -> HandlerRegistry {
    let mut reg = HandlerRegistry::new();
    reg.register(StartHandler);
    reg.register(ExitHandler);
    reg.register(ConditionalHandler);
    reg.register(crate::handlers::TaskHandler::new(backend.clone()));
    reg.register(crate::handlers::ToolHandler);
    reg.register(crate::handlers::FanInHandler::new(Some(backend)));
    reg.register(crate::handlers::SupervisorLoopHandler::default());
    reg
}

/// [`default_registry`] plus a `HumanGateHandler` for hexagon nodes.
pub fn default_registry_with_interviewer(
    backend: Arc<dyn TaskBackend>,
    interviewer: Arc<dyn crate::interviewer::Interviewer>,
) -> HandlerRegistry {
    let mut reg = default_registry(backend);
    reg.register(crate::handlers::HumanGateHandler::new(interviewer));
    reg
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
