//! HumanGateHandler — pauses traversal for a human decision (hexagon nodes).
//!
//! The question's choices come from the node's outgoing edge labels, so the
//! answer routes by preferred label. A timeout falls back to the node's
//! `default_choice` when configured; otherwise the node reports `RETRY`,
//! bounded by its own retry policy (which means immediate failure for nodes
//! without one). A skipped answer is terminal for the node's gate.

use std::sync::Arc;

use async_trait::async_trait;

use trellis_types::{Context, Outcome, Result, StageStatus};

use crate::artifacts::ArtifactStore;
use crate::graph::{PipelineGraph, PipelineNode};
use crate::handler::NodeHandler;
use crate::interviewer::{Interviewer, Question};

pub struct HumanGateHandler {
    interviewer: Arc<dyn Interviewer>,
}

impl HumanGateHandler {
    pub fn new(interviewer: Arc<dyn Interviewer>) -> Self {
        Self { interviewer }
    }
}

#[async_trait]
impl NodeHandler for HumanGateHandler {
    fn handler_type(&self) -> &str {
        "human.gate"
    }

    async fn execute(
        &self,
        node: &PipelineNode,
        _ctx: &Context,
        graph: &PipelineGraph,
        _artifacts: &ArtifactStore,
    ) -> Result<Outcome> {
        let choices: Vec<String> = graph
            .outgoing_edges(&node.id)
            .iter()
            .filter_map(|e| e.label.clone())
            .collect();

        let question = Question {
            node_id: node.id.clone(),
            prompt: node.prompt.clone().unwrap_or_else(|| node.label.clone()),
            choices: if choices.is_empty() {
                vec!["Continue".into()]
            } else {
                choices
            },
            default_choice: node.default_choice.clone(),
            timeout: node.timeout,
        };

        let asked = match node.timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, self.interviewer.ask(&question)).await {
                    Ok(result) => result,
                    Err(_) => {
                        // Timed out waiting for a human.
                        return Ok(match node.default_choice.clone() {
                            Some(default) => {
                                tracing::info!(
                                    node = %node.id,
                                    %default,
                                    "Interview timed out, using default choice"
                                );
                                Outcome::with_label(StageStatus::Success, default)
                                    .with_update(
                                        format!("{}.timed_out", node.id),
                                        serde_json::json!(true),
                                    )
                            }
                            None => Outcome::retry("human response timed out"),
                        });
                    }
                }
            }
            None => self.interviewer.ask(&question).await,
        };

        let answer = asked?;

        if answer.skipped {
            return Ok(Outcome::skipped("human skipped the question"));
        }

        let mut outcome = Outcome::with_label(StageStatus::Success, answer.choice.clone());
        outcome.notes = "Human responded".into();
        outcome.context_updates.insert(
            format!("{}.answer", node.id),
            serde_json::Value::String(answer.choice),
        );
        if let Some(text) = answer.custom_text {
            outcome
                .context_updates
                .insert(format!("{}.answer_text", node.id), serde_json::json!(text));
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interviewer::{Answer, QueueInterviewer, RecordingInterviewer};
    use trellis_types::TrellisError;

    fn build(dot: &str) -> PipelineGraph {
        PipelineGraph::from_dot(trellis_dot::parse(dot).unwrap()).unwrap()
    }

    fn review_graph() -> PipelineGraph {
        build(
            r#"digraph G {
                review [shape="hexagon", prompt="Please review"]
                review -> ship [label="Approve"]
                review -> fix [label="Reject"]
            }"#,
        )
    }

    fn store() -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let s = ArtifactStore::new(dir.path());
        (dir, s)
    }

    #[tokio::test]
    async fn choices_come_from_edge_labels() {
        let interviewer = Arc::new(RecordingInterviewer::new(QueueInterviewer::new(vec![
            Answer::choice("Approve"),
        ])));
        let handler = HumanGateHandler::new(interviewer.clone());
        let graph = review_graph();
        let node = graph.node("review").unwrap().clone();
        let (_dir, artifacts) = store();

        let outcome = handler
            .execute(&node, &Context::new(), &graph, &artifacts)
            .await
            .unwrap();

        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(outcome.preferred_label.as_deref(), Some("Approve"));
        assert_eq!(
            outcome.context_updates.get("review.answer"),
            Some(&serde_json::json!("Approve"))
        );

        let questions = interviewer.questions();
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].prompt, "Please review");
        assert!(questions[0].choices.contains(&"Approve".to_string()));
        assert!(questions[0].choices.contains(&"Reject".to_string()));
    }

    #[tokio::test]
    async fn skipped_answer_is_terminal() {
        let interviewer = Arc::new(QueueInterviewer::new(vec![Answer::skip()]));
        let handler = HumanGateHandler::new(interviewer);
        let graph = review_graph();
        let node = graph.node("review").unwrap().clone();
        let (_dir, artifacts) = store();

        let outcome = handler
            .execute(&node, &Context::new(), &graph, &artifacts)
            .await
            .unwrap();
        assert_eq!(outcome.status, StageStatus::Skipped);
    }

    #[tokio::test]
    async fn unlabeled_edges_get_continue_choice() {
        let interviewer = Arc::new(RecordingInterviewer::new(QueueInterviewer::new(vec![
            Answer::choice("Continue"),
        ])));
        let handler = HumanGateHandler::new(interviewer.clone());
        let graph = build(
            r#"digraph G {
                gate [shape="hexagon"]
                gate -> next
            }"#,
        );
        let node = graph.node("gate").unwrap().clone();
        let (_dir, artifacts) = store();

        let outcome = handler
            .execute(&node, &Context::new(), &graph, &artifacts)
            .await
            .unwrap();
        assert_eq!(outcome.preferred_label.as_deref(), Some("Continue"));
        assert_eq!(
            interviewer.questions()[0].choices,
            vec!["Continue".to_string()]
        );
    }

    /// Interviewer that never answers; used for timeout tests.
    struct StallingInterviewer;

    #[async_trait]
    impl Interviewer for StallingInterviewer {
        async fn ask(&self, _q: &Question) -> Result<Answer> {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            }
        }
    }

    #[tokio::test]
    async fn timeout_with_default_choice_succeeds() {
        let handler = HumanGateHandler::new(Arc::new(StallingInterviewer));
        let graph = build(
            r#"digraph G {
                gate [shape="hexagon", timeout=50ms, default_choice="Approve"]
                gate -> ship [label="Approve"]
            }"#,
        );
        let node = graph.node("gate").unwrap().clone();
        let (_dir, artifacts) = store();

        let outcome = handler
            .execute(&node, &Context::new(), &graph, &artifacts)
            .await
            .unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(outcome.preferred_label.as_deref(), Some("Approve"));
        assert_eq!(
            outcome.context_updates.get("gate.timed_out"),
            Some(&serde_json::json!(true))
        );
    }

    #[tokio::test]
    async fn timeout_without_default_requests_retry() {
        let handler = HumanGateHandler::new(Arc::new(StallingInterviewer));
        let graph = build(
            r#"digraph G {
                gate [shape="hexagon", timeout=50ms]
                gate -> next [label="OK"]
            }"#,
        );
        let node = graph.node("gate").unwrap().clone();
        let (_dir, artifacts) = store();

        let outcome = handler
            .execute(&node, &Context::new(), &graph, &artifacts)
            .await
            .unwrap();
        assert_eq!(outcome.status, StageStatus::Retry);
    }

    /// Interviewer whose transport broke.
    struct FailingInterviewer;

    #[async_trait]
    impl Interviewer for FailingInterviewer {
        async fn ask(&self, _q: &Question) -> Result<Answer> {
            Err(TrellisError::Other("transport closed".into()))
        }
    }

    #[tokio::test]
    async fn interviewer_error_propagates() {
        let handler = HumanGateHandler::new(Arc::new(FailingInterviewer));
        let graph = review_graph();
        let node = graph.node("review").unwrap().clone();
        let (_dir, artifacts) = store();

        let err = handler
            .execute(&node, &Context::new(), &graph, &artifacts)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("transport closed"));
    }
}
