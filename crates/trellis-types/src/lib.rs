//! Shared types, errors, context, and outcome for the Trellis pipeline engine.
//!
//! This crate provides the foundational types used across the other Trellis
//! crates:
//! - `TrellisError` — unified error taxonomy
//! - `Context` — thread-safe key-value store for run state
//! - `Outcome` — result of executing a node handler
//! - `Checkpoint` — serializable snapshot for crash recovery
//! - `Artifact` — named payload kept out of the context

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Unified error type for all Trellis subsystems.
///
/// The taxonomy follows three buckets: retryable (transient backend trouble),
/// terminal (auth/validation/config — retrying cannot help), and structural
/// (bad graphs — the run aborts). See [`TrellisError::is_retryable`] and
/// [`TrellisError::is_terminal`].
#[derive(Debug, thiserror::Error)]
pub enum TrellisError {
    // === Backend errors ===
    #[error("Backend error: {message}")]
    BackendError { message: String, retryable: bool },

    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    // === Graph errors ===
    #[error("Graph parse error at line {line}, col {col}: {message}")]
    ParseError {
        line: usize,
        col: usize,
        message: String,
        source_snippet: Option<String>,
    },

    #[error("Graph validation failed: {0}")]
    ValidationError(String),

    #[error("Bad configuration: {0}")]
    ConfigError(String),

    // === Execution errors ===
    #[error("Handler '{handler}' failed on node '{node}': {message}")]
    HandlerError {
        handler: String,
        node: String,
        message: String,
    },

    #[error("goal gate unsatisfied, no retry target (node '{node}')")]
    GoalGateUnsatisfied { node: String },

    #[error("max retries exceeded for node '{node}' after {attempts} attempts")]
    RetriesExhausted { node: String, attempts: usize },

    #[error("Run cancelled at node '{node}'")]
    Cancelled { node: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl TrellisError {
    /// Returns `true` if the error is transient and the operation may succeed
    /// on retry. 4xx-style auth/validation/config failures never qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TrellisError::RateLimited { .. }
                | TrellisError::Timeout { .. }
                | TrellisError::BackendError {
                    retryable: true,
                    ..
                }
        )
    }

    /// Returns `true` if the error is permanent and retrying will not help.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TrellisError::AuthFailed(_)
                | TrellisError::ValidationError(_)
                | TrellisError::ConfigError(_)
        )
    }

    /// Returns `true` for errors that indicate a malformed graph discovered at
    /// runtime; these abort the run instead of being folded into an Outcome.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            TrellisError::ParseError { .. } | TrellisError::ValidationError(_)
        )
    }
}

/// A convenience alias for `Result<T, TrellisError>`.
pub type Result<T> = std::result::Result<T, TrellisError>;

// ---------------------------------------------------------------------------
// Context — thread-safe key-value store for run state
// ---------------------------------------------------------------------------

/// Thread-safe key-value store shared across pipeline nodes.
///
/// Cloning a `Context` yields another handle to the **same** inner state.
/// Use [`clone_isolated`](Context::clone_isolated) to get a deep copy for
/// parallel branch isolation.
#[derive(Clone)]
pub struct Context {
    inner: Arc<tokio::sync::RwLock<ContextInner>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContextInner {
    values: HashMap<String, serde_json::Value>,
    logs: Vec<String>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(tokio::sync::RwLock::new(ContextInner {
                values: HashMap::new(),
                logs: Vec::new(),
            })),
        }
    }

    /// Rebuild a context from a checkpoint snapshot.
    pub fn from_snapshot(values: HashMap<String, serde_json::Value>, logs: Vec<String>) -> Self {
        Self {
            inner: Arc::new(tokio::sync::RwLock::new(ContextInner { values, logs })),
        }
    }

    /// Insert or overwrite a key.
    pub async fn set(&self, key: impl Into<String>, value: serde_json::Value) {
        self.inner.write().await.values.insert(key.into(), value);
    }

    /// Read a value by key (cloned).
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.read().await.values.get(key).cloned()
    }

    /// Convenience accessor that returns a `String`. Falls back to `default`
    /// when the key is absent or not a JSON string.
    pub async fn get_string(&self, key: &str, default: &str) -> String {
        self.inner
            .read()
            .await
            .values
            .get(key)
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| default.to_owned())
    }

    /// Convenience accessor for boolean flags. Absent or non-bool keys read
    /// as `false`.
    pub async fn get_flag(&self, key: &str) -> bool {
        self.inner
            .read()
            .await
            .values
            .get(key)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Remove a key, returning its prior value if present.
    pub async fn remove(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.write().await.values.remove(key)
    }

    /// Append a free-form log entry.
    pub async fn append_log(&self, entry: impl Into<String>) {
        self.inner.write().await.logs.push(entry.into());
    }

    /// Snapshot of the run log.
    pub async fn logs(&self) -> Vec<String> {
        self.inner.read().await.logs.clone()
    }

    /// Shallow copy of the current values map.
    pub async fn snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.inner.read().await.values.clone()
    }

    /// Deep copy that is fully independent of the original context. Parallel
    /// branches run against one of these so sibling mutations stay invisible.
    pub async fn clone_isolated(&self) -> Context {
        let guard = self.inner.read().await;
        Context {
            inner: Arc::new(tokio::sync::RwLock::new(guard.clone())),
        }
    }

    /// Merge `updates` into the context. Existing keys not present in
    /// `updates` are preserved.
    pub async fn apply_updates(&self, updates: HashMap<String, serde_json::Value>) {
        let mut guard = self.inner.write().await;
        guard.values.extend(updates);
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// StageStatus — outcome status of a pipeline node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    PartialSuccess,
    Retry,
    Fail,
    Skipped,
}

impl StageStatus {
    /// Lowercase form used in edge conditions and the `outcome` context key.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Success => "success",
            StageStatus::PartialSuccess => "partial_success",
            StageStatus::Retry => "retry",
            StageStatus::Fail => "fail",
            StageStatus::Skipped => "skipped",
        }
    }

    /// Rank used by fan-in candidate ordering; higher is better.
    pub fn rank(&self) -> u8 {
        match self {
            StageStatus::Success => 4,
            StageStatus::PartialSuccess => 3,
            StageStatus::Retry => 2,
            StageStatus::Skipped => 1,
            StageStatus::Fail => 0,
        }
    }

    /// A goal gate is satisfied by success or partial success.
    pub fn satisfies_gate(&self) -> bool {
        matches!(self, StageStatus::Success | StageStatus::PartialSuccess)
    }
}

// ---------------------------------------------------------------------------
// Outcome — result of executing a node handler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub status: StageStatus,
    pub preferred_label: Option<String>,
    pub suggested_next_ids: Vec<String>,
    pub context_updates: HashMap<String, serde_json::Value>,
    pub notes: String,
    pub failure_reason: Option<String>,
}

impl Outcome {
    fn base(status: StageStatus) -> Self {
        Self {
            status,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
            context_updates: HashMap::new(),
            notes: String::new(),
            failure_reason: None,
        }
    }

    /// Create a successful outcome with the given notes.
    pub fn success(notes: impl Into<String>) -> Self {
        Self {
            notes: notes.into(),
            ..Self::base(StageStatus::Success)
        }
    }

    /// Create a partial-success outcome with the given notes.
    pub fn partial(notes: impl Into<String>) -> Self {
        Self {
            notes: notes.into(),
            ..Self::base(StageStatus::PartialSuccess)
        }
    }

    /// Create a retry-requested outcome.
    pub fn retry(notes: impl Into<String>) -> Self {
        Self {
            notes: notes.into(),
            ..Self::base(StageStatus::Retry)
        }
    }

    /// Create a failed outcome with the given reason.
    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Self::base(StageStatus::Fail)
        }
    }

    /// Create a skipped outcome with the given reason.
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Self::base(StageStatus::Skipped)
        }
    }

    /// Create an outcome with a specific status and preferred edge label.
    pub fn with_label(status: StageStatus, label: impl Into<String>) -> Self {
        Self {
            preferred_label: Some(label.into()),
            ..Self::base(status)
        }
    }

    /// Attach a context update, builder-style.
    pub fn with_update(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context_updates.insert(key.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// Checkpoint — serializable snapshot for crash recovery
// ---------------------------------------------------------------------------

/// Snapshot of traversal state, written after every node completion.
///
/// A checkpoint is always consistent with exactly one point in the traversal:
/// it is produced only after the node's Outcome has been fully applied to the
/// context. `node_outcomes` is carried beyond the wire-contract fields so
/// goal-gate enforcement still works after a resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub current_node: String,
    pub completed_nodes: Vec<String>,
    pub node_retries: HashMap<String, usize>,
    pub context: HashMap<String, serde_json::Value>,
    pub logs: Vec<String>,
    #[serde(default)]
    pub node_outcomes: HashMap<String, Outcome>,
}

// ---------------------------------------------------------------------------
// Artifact — named payload kept out of the context
// ---------------------------------------------------------------------------

/// A named, possibly large payload produced by a node. Small artifacts are
/// stored inline; larger ones are file-backed so checkpoints stay small.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub size: usize,
    /// Populated when the payload fits under the store's inline threshold.
    pub inline: Option<String>,
    /// Populated when the payload was written to disk instead.
    pub path: Option<PathBuf>,
}

impl Artifact {
    pub fn is_inline(&self) -> bool {
        self.inline.is_some()
    }
}

// ---------------------------------------------------------------------------
// FidelityMode — how much prior session state a node's backend call carries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FidelityMode {
    Full,
    Truncate,
    Compact,
    SummaryLow,
    SummaryMedium,
    SummaryHigh,
}

impl FidelityMode {
    /// Parse the attribute form used in graphs: a bare prefix or
    /// `summary:<level>`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "full" => Some(FidelityMode::Full),
            "truncate" => Some(FidelityMode::Truncate),
            "compact" => Some(FidelityMode::Compact),
            "summary" | "summary:medium" => Some(FidelityMode::SummaryMedium),
            "summary:low" => Some(FidelityMode::SummaryLow),
            "summary:high" => Some(FidelityMode::SummaryHigh),
            _ => None,
        }
    }
}
