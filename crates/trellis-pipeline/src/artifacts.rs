//! Run-scoped artifact storage.
//!
//! Artifacts are named payloads produced by nodes (rendered prompts, raw
//! backend responses, status files) kept out of the context so checkpoints
//! stay small. Payloads under the inline threshold are carried inside the
//! [`Artifact`] record; larger ones are written to the run directory and
//! referenced by path.

use std::path::{Path, PathBuf};

use trellis_types::{Artifact, Result, TrellisError};

/// Default cutoff between inline and file-backed storage.
pub const DEFAULT_INLINE_THRESHOLD: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    inline_threshold: usize,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
        }
    }

    pub fn with_threshold(root: impl Into<PathBuf>, inline_threshold: usize) -> Self {
        Self {
            root: root.into(),
            inline_threshold,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store a text payload under `name`. Small payloads stay inline; larger
    /// ones land in `<root>/<sanitized-name>`.
    pub async fn put_text(&self, name: &str, content: &str) -> Result<Artifact> {
        let size = content.len();
        if size <= self.inline_threshold {
            return Ok(Artifact {
                name: name.to_string(),
                size,
                inline: Some(content.to_string()),
                path: None,
            });
        }

        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(sanitize(name));
        tokio::fs::write(&path, content).await?;
        tracing::debug!(name, size, path = %path.display(), "Artifact written to disk");
        Ok(Artifact {
            name: name.to_string(),
            size,
            inline: None,
            path: Some(path),
        })
    }

    /// Store a JSON value under `name` (pretty-printed).
    pub async fn put_json(&self, name: &str, value: &serde_json::Value) -> Result<Artifact> {
        let text = serde_json::to_string_pretty(value)?;
        self.put_text(name, &text).await
    }

    /// Always write `name` to disk, regardless of size. Used for the per-node
    /// status artifacts that external tooling reads back.
    pub async fn write_file(&self, name: &str, content: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(sanitize(name));
        tokio::fs::write(&path, content).await?;
        Ok(path)
    }

    /// Read an artifact's payload back, wherever it lives.
    pub async fn read_text(&self, artifact: &Artifact) -> Result<String> {
        if let Some(ref inline) = artifact.inline {
            return Ok(inline.clone());
        }
        match artifact.path {
            Some(ref path) => Ok(tokio::fs::read_to_string(path).await?),
            None => Err(TrellisError::Other(format!(
                "artifact '{}' has neither inline content nor a path",
                artifact.name
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// StatusArtifact — the per-node audit record
// ---------------------------------------------------------------------------

/// Wire form of a node's status artifact.
///
/// Written after every node completion (by the handler, or synthesized by the
/// engine for auto-status nodes). Also the channel through which external
/// tooling hands an Outcome back for tool-invoked nodes: a command spawned by
/// the tool handler may write this JSON to the path in `TRELLIS_STATUS_FILE`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StatusArtifact {
    pub outcome: trellis_types::StageStatus,
    #[serde(default)]
    pub preferred_next_label: Option<String>,
    #[serde(default)]
    pub suggested_next_ids: Vec<String>,
    #[serde(default)]
    pub context_updates: std::collections::HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub notes: String,
}

impl From<&trellis_types::Outcome> for StatusArtifact {
    fn from(outcome: &trellis_types::Outcome) -> Self {
        Self {
            outcome: outcome.status,
            preferred_next_label: outcome.preferred_label.clone(),
            suggested_next_ids: outcome.suggested_next_ids.clone(),
            context_updates: outcome.context_updates.clone(),
            notes: outcome.notes.clone(),
        }
    }
}

impl StatusArtifact {
    pub fn into_outcome(self) -> trellis_types::Outcome {
        let failure_reason = match self.outcome {
            trellis_types::StageStatus::Fail | trellis_types::StageStatus::Skipped => {
                Some(if self.notes.is_empty() {
                    "reported by status artifact".to_string()
                } else {
                    self.notes.clone()
                })
            }
            _ => None,
        };
        trellis_types::Outcome {
            status: self.outcome,
            preferred_label: self.preferred_next_label,
            suggested_next_ids: self.suggested_next_ids,
            context_updates: self.context_updates,
            notes: self.notes,
            failure_reason,
        }
    }
}

/// Keep artifact names filesystem-safe.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn small_payloads_stay_inline() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());

        let artifact = store.put_text("note.txt", "short").await.unwrap();
        assert!(artifact.is_inline());
        assert!(artifact.path.is_none());
        assert_eq!(artifact.size, 5);
        assert_eq!(store.read_text(&artifact).await.unwrap(), "short");
        // Nothing written to disk.
        assert!(!dir.path().join("note.txt").exists());
    }

    #[tokio::test]
    async fn large_payloads_are_file_backed() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::with_threshold(dir.path(), 16);

        let body = "x".repeat(100);
        let artifact = store.put_text("big.txt", &body).await.unwrap();
        assert!(!artifact.is_inline());
        let path = artifact.path.clone().unwrap();
        assert!(path.exists());
        assert_eq!(store.read_text(&artifact).await.unwrap(), body);
    }

    #[tokio::test]
    async fn json_artifacts_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());

        let value = serde_json::json!({"outcome": "success", "notes": "done"});
        let artifact = store.put_json("status.json", &value).await.unwrap();
        let text = store.read_text(&artifact).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, value);
    }

    #[tokio::test]
    async fn names_are_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::with_threshold(dir.path(), 0);

        let artifact = store.put_text("a/b c.txt", "payload!").await.unwrap();
        let path = artifact.path.unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "a_b_c.txt"
        );
    }

    #[tokio::test]
    async fn write_file_always_hits_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let path = store.write_file("node.status.json", "{}").await.unwrap();
        assert!(path.exists());
    }

    #[test]
    fn status_artifact_round_trips_an_outcome() {
        let outcome = trellis_types::Outcome::with_label(
            trellis_types::StageStatus::Success,
            "approve",
        )
        .with_update("k", serde_json::json!(1));

        let artifact = StatusArtifact::from(&outcome);
        assert_eq!(artifact.preferred_next_label.as_deref(), Some("approve"));

        let back = artifact.into_outcome();
        assert_eq!(back.status, outcome.status);
        assert_eq!(back.preferred_label, outcome.preferred_label);
        assert_eq!(back.context_updates, outcome.context_updates);
    }

    #[test]
    fn status_artifact_parses_minimal_json() {
        let parsed: StatusArtifact =
            serde_json::from_str(r#"{"outcome": "fail"}"#).unwrap();
        let outcome = parsed.into_outcome();
        assert_eq!(outcome.status, trellis_types::StageStatus::Fail);
        assert!(outcome.failure_reason.is_some());
    }
}
