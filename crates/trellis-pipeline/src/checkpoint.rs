//! Checkpoint persistence and crash recovery.
//!
//! After every node completion the executor persists a
//! [`Checkpoint`](trellis_types::Checkpoint) to the run directory. The write
//! is atomic (temp file, then rename) so a crash mid-write can never corrupt
//! the most recent valid checkpoint. On restart, [`load_checkpoint`] reads the
//! snapshot back in full so the run can resume from the node following
//! `current_node`.

use std::path::{Path, PathBuf};

use trellis_types::{Checkpoint, Result};

const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Save a checkpoint into `run_dir`, creating the directory if needed.
///
/// Writes `checkpoint.json.tmp` first and renames it over the final path;
/// rename is atomic on POSIX filesystems, so readers always observe either
/// the previous checkpoint or the new one, never a torn write.
pub async fn save_checkpoint(checkpoint: &Checkpoint, run_dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(run_dir).await?;
    let path = run_dir.join(CHECKPOINT_FILE);
    let tmp = run_dir.join(format!("{CHECKPOINT_FILE}.tmp"));

    let json = serde_json::to_string_pretty(checkpoint)?;
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, &path).await?;

    tracing::debug!(path = %path.display(), node = %checkpoint.current_node, "Checkpoint saved");
    Ok(path)
}

/// Load the checkpoint from `run_dir`. Returns `Ok(None)` when none exists
/// (first run, or after [`clear_checkpoint`]).
pub async fn load_checkpoint(run_dir: &Path) -> Result<Option<Checkpoint>> {
    let path = run_dir.join(CHECKPOINT_FILE);
    if !tokio::fs::try_exists(&path).await? {
        return Ok(None);
    }
    let json = tokio::fs::read_to_string(&path).await?;
    Ok(Some(serde_json::from_str(&json)?))
}

/// Delete the checkpoint after a successful run.
pub async fn clear_checkpoint(run_dir: &Path) -> Result<()> {
    let path = run_dir.join(CHECKPOINT_FILE);
    if tokio::fs::try_exists(&path).await? {
        tokio::fs::remove_file(&path).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use trellis_types::Outcome;

    fn sample() -> Checkpoint {
        let mut retries = HashMap::new();
        retries.insert("build".to_string(), 2);
        let mut context = HashMap::new();
        context.insert("key".to_string(), serde_json::json!("value"));
        let mut outcomes = HashMap::new();
        outcomes.insert("build".to_string(), Outcome::success("compiled"));

        Checkpoint {
            timestamp: chrono::Utc::now(),
            current_node: "build".into(),
            completed_nodes: vec!["start".into(), "build".into()],
            node_retries: retries,
            context,
            logs: vec!["run started".into()],
            node_outcomes: outcomes,
        }
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cp = sample();

        let path = save_checkpoint(&cp, dir.path()).await.unwrap();
        assert!(path.exists());

        let loaded = load_checkpoint(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded.current_node, cp.current_node);
        assert_eq!(loaded.completed_nodes, cp.completed_nodes);
        assert_eq!(loaded.node_retries, cp.node_retries);
        assert_eq!(loaded.context, cp.context);
        assert_eq!(loaded.logs, cp.logs);
    }

    #[tokio::test]
    async fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        save_checkpoint(&sample(), dir.path()).await.unwrap();
        assert!(!dir.path().join("checkpoint.json.tmp").exists());
        assert!(dir.path().join("checkpoint.json").exists());
    }

    #[tokio::test]
    async fn overwrite_keeps_latest() {
        let dir = tempfile::tempdir().unwrap();
        let mut cp = sample();
        save_checkpoint(&cp, dir.path()).await.unwrap();

        cp.current_node = "verify".into();
        cp.completed_nodes.push("verify".into());
        save_checkpoint(&cp, dir.path()).await.unwrap();

        let loaded = load_checkpoint(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded.current_node, "verify");
        assert_eq!(loaded.completed_nodes.len(), 3);
    }

    #[tokio::test]
    async fn missing_dir_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(load_checkpoint(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        save_checkpoint(&sample(), dir.path()).await.unwrap();
        clear_checkpoint(dir.path()).await.unwrap();
        assert!(load_checkpoint(dir.path()).await.unwrap().is_none());
        // Clearing twice is fine.
        clear_checkpoint(dir.path()).await.unwrap();
    }
}
