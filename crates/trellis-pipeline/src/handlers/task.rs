//! TaskHandler — the default generation handler for box-shaped nodes.
//!
//! Renders the node's prompt (expanding the `${goal}` template variable),
//! hands it to the configured [`TaskBackend`], persists the rendered prompt
//! and the raw response as run artifacts, and folds a bounded excerpt of the
//! response into the context.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use trellis_types::{Context, Outcome, Result, StageStatus};

use crate::artifacts::ArtifactStore;
use crate::backend::{BackendReply, TaskBackend};
use crate::graph::{PipelineGraph, PipelineNode};
use crate::handler::NodeHandler;

/// Upper bound on the response excerpt folded into `context_updates`.
const EXCERPT_LIMIT: usize = 2000;

pub struct TaskHandler {
    backend: Arc<dyn TaskBackend>,
}

impl TaskHandler {
    pub fn new(backend: Arc<dyn TaskBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl NodeHandler for TaskHandler {
    fn handler_type(&self) -> &str {
        "task"
    }

    async fn execute(
        &self,
        node: &PipelineNode,
        context: &Context,
        graph: &PipelineGraph,
        artifacts: &ArtifactStore,
    ) -> Result<Outcome> {
        let raw_prompt = node.prompt.as_deref().unwrap_or("No prompt specified");
        let mut prompt = raw_prompt.replace("${goal}", &graph.goal);

        // Conditional nodes routed here need the backend to pick an edge.
        let is_conditional =
            node.shape == "diamond" || node.node_type.as_deref() == Some("conditional");
        let edge_labels: Vec<String> = if is_conditional {
            graph
                .outgoing_edges(&node.id)
                .iter()
                .filter_map(|e| e.label.clone())
                .collect()
        } else {
            Vec::new()
        };
        if !edge_labels.is_empty() {
            prompt.push_str(&format!(
                "\n\nEnd your response with exactly one of these labels on its own line: {}",
                edge_labels.join(", ")
            ));
        }

        tracing::info!(node = %node.id, label = %node.label, "Executing task handler");

        if context.get_flag("dry_run").await {
            tracing::info!(node = %node.id, "Dry run, backend not invoked");
            return Ok(Outcome::success(format!("Dry run: {}", node.label))
                .with_update(format!("{}.completed", node.id), serde_json::json!(true))
                .with_update(format!("{}.dry_run", node.id), serde_json::json!(true)));
        }

        artifacts
            .put_text(&format!("{}.prompt.txt", node.id), &prompt)
            .await?;

        // The backend may answer with plain text or a fully-formed outcome.
        // Errors propagate: the retry policy sees retryable ones, the engine
        // folds the rest into FAIL.
        let reply = self.backend.run(node, &prompt, context).await?;

        match reply {
            BackendReply::Structured(outcome) => {
                artifacts
                    .put_json(
                        &format!("{}.response.json", node.id),
                        &serde_json::to_value(&outcome)?,
                    )
                    .await?;
                Ok(outcome)
            }
            BackendReply::Text(text) => {
                artifacts
                    .put_text(&format!("{}.response.txt", node.id), &text)
                    .await?;

                let preferred_label = if edge_labels.is_empty() {
                    None
                } else {
                    extract_label(&text, &edge_labels)
                };

                let mut updates = HashMap::new();
                updates.insert(
                    format!("{}.completed", node.id),
                    serde_json::Value::Bool(true),
                );
                updates.insert(
                    format!("{}.result", node.id),
                    serde_json::Value::String(excerpt(&text)),
                );

                Ok(Outcome {
                    status: StageStatus::Success,
                    preferred_label,
                    suggested_next_ids: vec![],
                    context_updates: updates,
                    notes: excerpt(&text),
                    failure_reason: None,
                })
            }
        }
    }
}

/// Bounded excerpt at a char boundary.
fn excerpt(text: &str) -> String {
    if text.len() <= EXCERPT_LIMIT {
        return text.to_string();
    }
    let cut = text
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= EXCERPT_LIMIT)
        .last()
        .unwrap_or(0);
    format!("{}...(truncated)", &text[..cut])
}

/// Scan a reply for one of the expected edge labels: the last few lines
/// first (where the prompt asked for it), then the whole text.
fn extract_label(response: &str, labels: &[String]) -> Option<String> {
    for line in response.lines().rev().take(5) {
        let trimmed = line.trim();
        for label in labels {
            if trimmed.eq_ignore_ascii_case(label) {
                return Some(label.clone());
            }
        }
    }
    let upper = response.to_uppercase();
    labels
        .iter()
        .find(|label| upper.contains(&label.to_uppercase()))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{EchoBackend, ScriptedBackend};
    use crate::graph::PipelineGraph;

    fn build(dot: &str) -> PipelineGraph {
        PipelineGraph::from_dot(trellis_dot::parse(dot).unwrap()).unwrap()
    }

    fn store() -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let s = ArtifactStore::new(dir.path());
        (dir, s)
    }

    #[tokio::test]
    async fn goal_template_is_expanded() {
        let graph = build(
            r#"digraph G {
                goal = "ship v2"
                work [prompt="Work toward: ${goal}"]
                work -> done
            }"#,
        );
        let backend = Arc::new(ScriptedBackend::new());
        let handler = TaskHandler::new(backend.clone());
        let (_dir, artifacts) = store();
        let node = graph.node("work").unwrap().clone();

        handler
            .execute(&node, &Context::new(), &graph, &artifacts)
            .await
            .unwrap();

        let prompts = backend.prompts();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].1, "Work toward: ship v2");
    }

    #[tokio::test]
    async fn text_reply_becomes_success_with_excerpt() {
        let graph = build(r#"digraph G { work [prompt="p"] work -> done }"#);
        let handler = TaskHandler::new(Arc::new(EchoBackend));
        let (_dir, artifacts) = store();
        let node = graph.node("work").unwrap().clone();

        let outcome = handler
            .execute(&node, &Context::new(), &graph, &artifacts)
            .await
            .unwrap();

        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(
            outcome.context_updates.get("work.result"),
            Some(&serde_json::json!("p"))
        );
        assert_eq!(
            outcome.context_updates.get("work.completed"),
            Some(&serde_json::json!(true))
        );
    }

    #[tokio::test]
    async fn long_reply_is_truncated_in_context() {
        let graph = build(r#"digraph G { work [prompt="p"] work -> done }"#);
        let long = "y".repeat(5000);
        let backend = ScriptedBackend::new()
            .script("work", vec![Ok(BackendReply::Text(long))]);
        let handler = TaskHandler::new(Arc::new(backend));
        let (_dir, artifacts) = store();
        let node = graph.node("work").unwrap().clone();

        let outcome = handler
            .execute(&node, &Context::new(), &graph, &artifacts)
            .await
            .unwrap();

        let result = outcome.context_updates["work.result"].as_str().unwrap();
        assert!(result.len() < 3000);
        assert!(result.ends_with("...(truncated)"));
    }

    #[tokio::test]
    async fn structured_reply_is_used_verbatim() {
        let graph = build(r#"digraph G { work [prompt="p"] work -> done }"#);
        let scripted = Outcome::with_label(StageStatus::PartialSuccess, "retry_path")
            .with_update("custom", serde_json::json!("value"));
        let backend = ScriptedBackend::new()
            .script("work", vec![Ok(BackendReply::Structured(scripted))]);
        let handler = TaskHandler::new(Arc::new(backend));
        let (_dir, artifacts) = store();
        let node = graph.node("work").unwrap().clone();

        let outcome = handler
            .execute(&node, &Context::new(), &graph, &artifacts)
            .await
            .unwrap();

        assert_eq!(outcome.status, StageStatus::PartialSuccess);
        assert_eq!(outcome.preferred_label.as_deref(), Some("retry_path"));
        assert_eq!(
            outcome.context_updates.get("custom"),
            Some(&serde_json::json!("value"))
        );
    }

    #[tokio::test]
    async fn backend_error_propagates_for_engine_to_fold() {
        let graph = build(r#"digraph G { work [prompt="p"] work -> done }"#);
        let backend = ScriptedBackend::new().script(
            "work",
            vec![Err(trellis_types::TrellisError::BackendError {
                message: "provider exploded".into(),
                retryable: false,
            })],
        );
        let handler = TaskHandler::new(Arc::new(backend));
        let (_dir, artifacts) = store();
        let node = graph.node("work").unwrap().clone();

        let err = handler
            .execute(&node, &Context::new(), &graph, &artifacts)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("provider exploded"));
    }

    #[tokio::test]
    async fn conditional_node_extracts_label_from_reply() {
        let graph = build(
            r#"digraph G {
                check [shape="diamond", prompt="Which way?"]
                check -> left [label="GO_LEFT"]
                check -> right [label="GO_RIGHT"]
            }"#,
        );
        let backend = Arc::new(ScriptedBackend::new().script(
            "check",
            vec![Ok(BackendReply::Text("Thinking...\n\nGO_RIGHT".into()))],
        ));
        let handler = TaskHandler::new(backend.clone());
        let (_dir, artifacts) = store();
        let node = graph.node("check").unwrap().clone();

        let outcome = handler
            .execute(&node, &Context::new(), &graph, &artifacts)
            .await
            .unwrap();

        assert_eq!(outcome.preferred_label.as_deref(), Some("GO_RIGHT"));
        // The prompt listed the available labels.
        assert!(backend.prompts()[0].1.contains("GO_LEFT, GO_RIGHT"));
    }

    #[tokio::test]
    async fn dry_run_skips_backend() {
        let graph = build(r#"digraph G { work [prompt="p"] work -> done }"#);
        let backend = Arc::new(ScriptedBackend::new());
        let handler = TaskHandler::new(backend.clone());
        let (_dir, artifacts) = store();
        let node = graph.node("work").unwrap().clone();
        let ctx = Context::new();
        ctx.set("dry_run", serde_json::json!(true)).await;

        let outcome = handler.execute(&node, &ctx, &graph, &artifacts).await.unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(
            outcome.context_updates.get("work.dry_run"),
            Some(&serde_json::json!(true))
        );
        assert!(backend.prompts().is_empty());
    }

    #[test]
    fn extract_label_variants() {
        let labels = vec!["APPROVE".to_string(), "REJECT".to_string()];
        assert_eq!(
            extract_label("analysis...\n\nAPPROVE", &labels).as_deref(),
            Some("APPROVE")
        );
        assert_eq!(
            extract_label("final answer: approve", &labels).as_deref(),
            Some("APPROVE")
        );
        assert_eq!(extract_label("no label here", &labels), None);
    }
}
