//! Task backend contract.
//!
//! The engine never talks to an LLM or external worker directly; task nodes
//! go through this narrow trait. A backend may answer with plain text (the
//! task handler wraps it into a `SUCCESS` outcome) or with a fully-formed
//! [`Outcome`] when it wants to control routing itself. Errors raised here
//! flow through the retry policy and are folded into `FAIL` outcomes at the
//! engine boundary.

use std::collections::HashMap;

use async_trait::async_trait;

use trellis_types::{Context, Outcome, Result};

use crate::graph::PipelineNode;

/// The two reply shapes a backend may produce.
#[derive(Debug, Clone)]
pub enum BackendReply {
    /// Plain text; the task handler wraps it into a `SUCCESS` outcome.
    Text(String),
    /// A complete outcome, used verbatim (status, labels, updates and all).
    Structured(Outcome),
}

/// Well-known context key: set to `false` when the backend must not rely on a
/// persistent conversational session (the hop immediately after a resume).
pub const SESSION_PERSISTENT_KEY: &str = "session.persistent";

#[async_trait]
pub trait TaskBackend: Send + Sync {
    /// Perform the node's work against the rendered prompt.
    ///
    /// `context` is the live run context; backends that keep per-run sessions
    /// should honor [`SESSION_PERSISTENT_KEY`].
    async fn run(&self, node: &PipelineNode, prompt: &str, context: &Context)
        -> Result<BackendReply>;
}

// ---------------------------------------------------------------------------
// EchoBackend — answers every prompt with the prompt itself
// ---------------------------------------------------------------------------

/// Default backend used by the stock registry: echoes the rendered prompt.
/// Useful for dry runs and as the no-configuration default.
pub struct EchoBackend;

#[async_trait]
impl TaskBackend for EchoBackend {
    async fn run(
        &self,
        _node: &PipelineNode,
        prompt: &str,
        _context: &Context,
    ) -> Result<BackendReply> {
        Ok(BackendReply::Text(prompt.to_string()))
    }
}

// ---------------------------------------------------------------------------
// ScriptedBackend — canned replies for deterministic tests
// ---------------------------------------------------------------------------

type ReplyQueue = Vec<Result<BackendReply>>;

/// Test backend with per-node reply queues. Each call to a node pops the next
/// scripted reply; an exhausted or unknown node gets the default reply.
/// Records every prompt it receives.
pub struct ScriptedBackend {
    replies: std::sync::Mutex<HashMap<String, ReplyQueue>>,
    default_reply: String,
    prompts: std::sync::Mutex<Vec<(String, String)>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            replies: std::sync::Mutex::new(HashMap::new()),
            default_reply: "ok".to_string(),
            prompts: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Queue replies for a node, consumed first-to-last.
    pub fn script(self, node_id: &str, replies: Vec<Result<BackendReply>>) -> Self {
        {
            let mut guard = self.replies.lock().expect("scripted backend poisoned");
            let queue = guard.entry(node_id.to_string()).or_default();
            // Stored reversed so pop() yields first-queued first.
            for reply in replies.into_iter().rev() {
                queue.push(reply);
            }
        }
        self
    }

    /// Prompts seen so far, as `(node_id, prompt)` pairs.
    pub fn prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().expect("scripted backend poisoned").clone()
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskBackend for ScriptedBackend {
    async fn run(
        &self,
        node: &PipelineNode,
        prompt: &str,
        _context: &Context,
    ) -> Result<BackendReply> {
        self.prompts
            .lock()
            .expect("scripted backend poisoned")
            .push((node.id.clone(), prompt.to_string()));

        let next = self
            .replies
            .lock()
            .expect("scripted backend poisoned")
            .get_mut(&node.id)
            .and_then(|queue| queue.pop());

        match next {
            Some(reply) => reply,
            None => Ok(BackendReply::Text(self.default_reply.clone())),
        }
    }
}
