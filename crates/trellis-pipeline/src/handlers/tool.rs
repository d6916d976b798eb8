//! ToolHandler — runs an externally configured command (parallelogram nodes).
//!
//! The command runs under `sh -c` with the node's timeout and its captured
//! output folded into the context. A spawned command may hand a full Outcome
//! back by writing a status artifact to the path in `TRELLIS_STATUS_FILE`;
//! otherwise the exit code decides success or failure.

use std::collections::HashMap;

use async_trait::async_trait;

use trellis_types::{Context, Outcome, Result, StageStatus, TrellisError};

use crate::artifacts::{ArtifactStore, StatusArtifact};
use crate::graph::{PipelineGraph, PipelineNode};
use crate::handler::NodeHandler;

/// Environment variable naming the status hand-back file.
pub const STATUS_FILE_ENV: &str = "TRELLIS_STATUS_FILE";

const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(300);
const NOTES_LIMIT: usize = 4096;

pub struct ToolHandler;

#[async_trait]
impl NodeHandler for ToolHandler {
    fn handler_type(&self) -> &str {
        "tool"
    }

    async fn execute(
        &self,
        node: &PipelineNode,
        context: &Context,
        _graph: &PipelineGraph,
        artifacts: &ArtifactStore,
    ) -> Result<Outcome> {
        let command = node
            .string_attr("tool_command")
            .map(String::from)
            .ok_or_else(|| TrellisError::HandlerError {
                handler: "tool".into(),
                node: node.id.clone(),
                message: "Missing tool_command attribute".into(),
            })?;

        tracing::info!(node = %node.id, command = %command, "Executing tool command");

        if context.get_flag("dry_run").await {
            tracing::info!(node = %node.id, "Dry run, command not executed");
            return Ok(
                Outcome::success(format!("Dry run, command not executed: {command}"))
                    .with_update("last_tool_command", serde_json::json!(command))
                    .with_update(format!("{}.completed", node.id), serde_json::json!(true))
                    .with_update(format!("{}.dry_run", node.id), serde_json::json!(true)),
            );
        }

        let status_path = artifacts.root().join(format!("{}.status.json", node.id));
        tokio::fs::create_dir_all(artifacts.root()).await?;
        // Stale status files from a previous attempt must not be re-read.
        if tokio::fs::try_exists(&status_path).await? {
            tokio::fs::remove_file(&status_path).await?;
        }

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&command);
        cmd.env(STATUS_FILE_ENV, &status_path);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        if let Some(serde_json::Value::String(dir)) = context.get("workdir").await {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|e| TrellisError::HandlerError {
            handler: "tool".into(),
            node: node.id.clone(),
            message: format!("Failed to spawn command: {e}"),
        })?;

        let timeout_dur = node.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let output = tokio::time::timeout(timeout_dur, child.wait_with_output())
            .await
            .map_err(|_| TrellisError::Timeout {
                timeout_ms: timeout_dur.as_millis() as u64,
            })?
            .map_err(|e| TrellisError::HandlerError {
                handler: "tool".into(),
                node: node.id.clone(),
                message: format!("Command execution failed: {e}"),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        tracing::info!(
            node = %node.id,
            exit_code,
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            "Tool command completed"
        );

        // External tooling may have written a full outcome for us.
        if tokio::fs::try_exists(&status_path).await? {
            let json = tokio::fs::read_to_string(&status_path).await?;
            match serde_json::from_str::<StatusArtifact>(&json) {
                Ok(artifact) => {
                    tracing::debug!(node = %node.id, "Outcome read from status artifact");
                    return Ok(artifact.into_outcome());
                }
                Err(e) => {
                    return Ok(Outcome::fail(format!(
                        "Malformed status artifact from tool: {e}"
                    )));
                }
            }
        }

        let status = if output.status.success() {
            StageStatus::Success
        } else {
            StageStatus::Fail
        };

        let mut updates = HashMap::new();
        updates.insert(
            "last_tool_command".to_string(),
            serde_json::Value::String(command),
        );
        updates.insert(
            format!("{}.completed", node.id),
            serde_json::Value::Bool(true),
        );
        updates.insert(format!("{}.exit_code", node.id), serde_json::json!(exit_code));
        updates.insert(
            format!("{}.stdout", node.id),
            serde_json::Value::String(stdout.clone()),
        );
        if !stderr.is_empty() {
            updates.insert(
                format!("{}.stderr", node.id),
                serde_json::Value::String(stderr.clone()),
            );
        }

        let combined = if stderr.is_empty() {
            stdout
        } else {
            format!("{stdout}\n--- stderr ---\n{stderr}")
        };
        let notes = if combined.len() > NOTES_LIMIT {
            let cut = combined
                .char_indices()
                .map(|(i, _)| i)
                .take_while(|&i| i <= NOTES_LIMIT)
                .last()
                .unwrap_or(0);
            format!("{}...(truncated)", &combined[..cut])
        } else {
            combined
        };

        Ok(Outcome {
            status,
            preferred_label: None,
            suggested_next_ids: vec![],
            context_updates: updates,
            notes,
            failure_reason: (status == StageStatus::Fail)
                .then(|| format!("Command exited with code {exit_code}")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PipelineGraph;

    fn build(dot: &str) -> PipelineGraph {
        PipelineGraph::from_dot(trellis_dot::parse(dot).unwrap()).unwrap()
    }

    fn tool_graph(command: &str) -> PipelineGraph {
        build(&format!(
            r#"digraph G {{
                run [shape="parallelogram", tool_command="{command}"]
                run -> done
            }}"#
        ))
    }

    fn store() -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let s = ArtifactStore::new(dir.path());
        (dir, s)
    }

    #[tokio::test]
    async fn successful_command_captures_stdout() {
        let graph = tool_graph("echo hello");
        let node = graph.node("run").unwrap().clone();
        let (_dir, artifacts) = store();

        let outcome = ToolHandler
            .execute(&node, &Context::new(), &graph, &artifacts)
            .await
            .unwrap();

        assert_eq!(outcome.status, StageStatus::Success);
        assert!(outcome.notes.contains("hello"));
        assert_eq!(
            outcome.context_updates.get("run.exit_code"),
            Some(&serde_json::json!(0))
        );
        assert!(outcome.context_updates["run.stdout"]
            .as_str()
            .unwrap()
            .contains("hello"));
    }

    #[tokio::test]
    async fn failing_command_maps_to_fail() {
        let graph = tool_graph("exit 42");
        let node = graph.node("run").unwrap().clone();
        let (_dir, artifacts) = store();

        let outcome = ToolHandler
            .execute(&node, &Context::new(), &graph, &artifacts)
            .await
            .unwrap();

        assert_eq!(outcome.status, StageStatus::Fail);
        assert!(outcome.failure_reason.unwrap().contains("42"));
        assert_eq!(
            outcome.context_updates.get("run.exit_code"),
            Some(&serde_json::json!(42))
        );
    }

    #[tokio::test]
    async fn missing_command_attribute_errors() {
        let graph = build(
            r#"digraph G {
                run [shape="parallelogram"]
                run -> done
            }"#,
        );
        let node = graph.node("run").unwrap().clone();
        let (_dir, artifacts) = store();

        let err = ToolHandler
            .execute(&node, &Context::new(), &graph, &artifacts)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Missing tool_command"));
    }

    #[tokio::test]
    async fn command_can_hand_back_an_outcome_via_status_file() {
        let graph = tool_graph(
            r#"printf '{\"outcome\": \"success\", \"preferred_next_label\": \"fast_path\"}' > $TRELLIS_STATUS_FILE"#,
        );
        let node = graph.node("run").unwrap().clone();
        let (_dir, artifacts) = store();

        let outcome = ToolHandler
            .execute(&node, &Context::new(), &graph, &artifacts)
            .await
            .unwrap();

        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(outcome.preferred_label.as_deref(), Some("fast_path"));
    }

    #[tokio::test]
    async fn malformed_status_file_fails_the_node() {
        let graph = tool_graph("printf 'not json' > $TRELLIS_STATUS_FILE");
        let node = graph.node("run").unwrap().clone();
        let (_dir, artifacts) = store();

        let outcome = ToolHandler
            .execute(&node, &Context::new(), &graph, &artifacts)
            .await
            .unwrap();

        assert_eq!(outcome.status, StageStatus::Fail);
        assert!(outcome
            .failure_reason
            .unwrap()
            .contains("Malformed status artifact"));
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let graph = build(
            r#"digraph G {
                run [shape="parallelogram", tool_command="sleep 5", timeout=100ms]
                run -> done
            }"#,
        );
        let node = graph.node("run").unwrap().clone();
        let (_dir, artifacts) = store();

        let err = ToolHandler
            .execute(&node, &Context::new(), &graph, &artifacts)
            .await
            .unwrap_err();
        assert!(matches!(err, TrellisError::Timeout { timeout_ms: 100 }));
    }

    #[tokio::test]
    async fn dry_run_skips_execution() {
        let graph = tool_graph("echo never");
        let node = graph.node("run").unwrap().clone();
        let (_dir, artifacts) = store();
        let ctx = Context::new();
        ctx.set("dry_run", serde_json::json!(true)).await;

        let outcome = ToolHandler
            .execute(&node, &ctx, &graph, &artifacts)
            .await
            .unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
        assert!(outcome.notes.contains("Dry run"));
        assert_eq!(
            outcome.context_updates.get("run.dry_run"),
            Some(&serde_json::json!(true))
        );
    }

    #[tokio::test]
    async fn workdir_from_context() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("marker.txt"), "here")
            .await
            .unwrap();
        let graph = tool_graph("cat marker.txt");
        let node = graph.node("run").unwrap().clone();
        let (_adir, artifacts) = store();
        let ctx = Context::new();
        ctx.set(
            "workdir",
            serde_json::json!(dir.path().to_str().unwrap()),
        )
        .await;

        let outcome = ToolHandler
            .execute(&node, &ctx, &graph, &artifacts)
            .await
            .unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
        assert!(outcome.notes.contains("here"));
    }
}
