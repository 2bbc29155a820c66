//! Checkpoint save/restore and crash recovery for pipeline execution.
//!
//! After each node completion the executor persists a [`PipelineCheckpoint`]
//! to disk.  On restart, [`load_checkpoint`] discovers the snapshot so the
//! pipeline can resume from the last completed node instead of starting over.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Snapshot of pipeline execution state for crash recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineCheckpoint {
    /// Name of the graph being executed (its `name` graph attribute, or the
    /// DOT graph identifier).
    pub graph_name: String,
    /// The node that was being executed (or about to be executed) when the
    /// checkpoint was taken.
    pub current_node_id: String,
    /// Serialised snapshot of the pipeline [`Context`](attractor_types::Context).
    pub context_snapshot: HashMap<String, serde_json::Value>,
    /// Number of retry attempts consumed so far, keyed by node ID.
    pub retry_counts: HashMap<String, u32>,
    /// IDs of nodes visited so far, in visitation order.
    pub visited: Vec<String>,
    /// Identifier for this pipeline run, stable across checkpoints of the
    /// same run.
    pub run_id: Uuid,
    /// RFC 3339 timestamp of when the checkpoint was created.
    pub timestamp: String,
}

impl PipelineCheckpoint {
    /// Create a new checkpoint from current execution state.
    pub fn new(
        graph_name: String,
        current_node_id: String,
        context_snapshot: HashMap<String, serde_json::Value>,
        retry_counts: HashMap<String, u32>,
        visited: Vec<String>,
        run_id: Uuid,
    ) -> Self {
        Self {
            graph_name,
            current_node_id,
            context_snapshot,
            retry_counts,
            visited,
            run_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Save a checkpoint to the given directory, atomically.
///
/// The directory is created if it does not already exist.  The checkpoint is
/// written to a temp file in the same directory and renamed into place at
/// `<logs_root>/checkpoint.json`, so a crash mid-write never leaves a
/// truncated or partially-written checkpoint behind.
pub async fn save_checkpoint(
    checkpoint: &PipelineCheckpoint,
    logs_root: &Path,
) -> attractor_types::Result<PathBuf> {
    tokio::fs::create_dir_all(logs_root).await?;
    let path = logs_root.join("checkpoint.json");
    let tmp_path = logs_root.join(format!("checkpoint.json.{}.tmp", Uuid::new_v4()));
    let json = serde_json::to_string_pretty(checkpoint)?;
    tokio::fs::write(&tmp_path, json).await?;
    tokio::fs::rename(&tmp_path, &path).await?;
    tracing::debug!(path = %path.display(), "Checkpoint saved");
    Ok(path)
}

/// Load the checkpoint from a directory.
///
/// Returns `Ok(None)` when no checkpoint file exists (i.e. first run or after
/// [`clear_checkpoint`]). Unknown fields in the stored JSON are ignored so
/// older checkpoints remain loadable across minor format additions.
pub async fn load_checkpoint(
    logs_root: &Path,
) -> attractor_types::Result<Option<PipelineCheckpoint>> {
    let path = logs_root.join("checkpoint.json");
    if !tokio::fs::try_exists(&path).await? {
        return Ok(None);
    }
    let json = tokio::fs::read_to_string(&path).await?;
    let checkpoint: PipelineCheckpoint = serde_json::from_str(&json)?;
    Ok(Some(checkpoint))
}

/// Delete checkpoint after successful pipeline completion.
pub async fn clear_checkpoint(logs_root: &Path) -> attractor_types::Result<()> {
    let path = logs_root.join("checkpoint.json");
    if tokio::fs::try_exists(&path).await? {
        tokio::fs::remove_file(&path).await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
