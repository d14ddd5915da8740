//! Session checkpoints: persist/restore per-session progress.
//!
//! One pretty-printed JSON checkpoint per session lives at
//! `checkpoints/<session_id>.json`. The manager is stateless; storage is
//! authoritative, and the backend's tmp-then-rename write keeps interrupted
//! saves from corrupting the previous checkpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::errors::PipelineError;
use crate::progress::ProgressStats;
use crate::session::{RunContext, SessionId};
use crate::storage::Storage;

/// Durable progress record for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: SessionId,
    /// Index of the next phase to run; monotonically non-decreasing.
    pub phase_index: usize,
    /// Name of the last completed phase.
    pub phase_name: String,
    pub timestamp: DateTime<Utc>,
    /// Engine state; `last_output` holds the previous phase's data.
    pub state: HashMap<String, Value>,
    pub request: String,
    #[serde(default)]
    pub resume_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_resume_time: Option<DateTime<Utc>>,
    /// Set when unit progress was merged in: a resumer can continue inside
    /// the checkpointed phase instead of restarting it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_resume_within: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_progress: Option<ProgressStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_cache: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_states: Option<HashMap<String, Value>>,
}

impl Checkpoint {
    pub fn new(
        session_id: SessionId,
        phase_index: usize,
        phase_name: impl Into<String>,
        request: impl Into<String>,
        last_output: Value,
    ) -> Self {
        let mut state = HashMap::new();
        state.insert("last_output".to_string(), last_output);
        Self {
            session_id,
            phase_index,
            phase_name: phase_name.into(),
            timestamp: Utc::now(),
            state,
            request: request.into(),
            resume_count: 0,
            last_resume_time: None,
            can_resume_within: None,
            scene_progress: None,
            template_cache: None,
            phase_states: None,
        }
    }

    /// The previous phase's output data, for resuming.
    pub fn last_output(&self) -> Value {
        self.state.get("last_output").cloned().unwrap_or(Value::Null)
    }
}

fn checkpoint_path(session_id: &SessionId) -> String {
    format!("checkpoints/{session_id}.json")
}

/// Stateless manager persisting checkpoints through the storage seam.
pub struct CheckpointManager {
    storage: Arc<dyn Storage>,
}

impl CheckpointManager {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Persist the latest checkpoint for a session, replacing any previous
    /// one. A `phase_index` behind the stored one is clamped so the index
    /// never moves backwards within a session.
    pub async fn save(&self, ctx: &RunContext, checkpoint: Checkpoint) -> Result<(), PipelineError> {
        let mut checkpoint = checkpoint;
        if let Some(existing) = self.load(ctx, &checkpoint.session_id).await? {
            if existing.phase_index > checkpoint.phase_index {
                warn!(
                    session = %checkpoint.session_id,
                    stored = existing.phase_index,
                    incoming = checkpoint.phase_index,
                    "checkpoint index behind stored; clamping"
                );
                checkpoint.phase_index = existing.phase_index;
            }
            checkpoint.resume_count = checkpoint.resume_count.max(existing.resume_count);
            if checkpoint.last_resume_time.is_none() {
                checkpoint.last_resume_time = existing.last_resume_time;
            }
        }

        let bytes = serde_json::to_vec_pretty(&checkpoint)
            .map_err(|e| PipelineError::other(format!("serialize checkpoint: {e}")))?;
        self.storage
            .save(ctx, &checkpoint_path(&checkpoint.session_id), &bytes)
            .await?;
        debug!(
            session = %checkpoint.session_id,
            phase_index = checkpoint.phase_index,
            phase = %checkpoint.phase_name,
            "checkpoint saved"
        );
        Ok(())
    }

    /// Persist a checkpoint with unit progress merged in, flagging that a
    /// resumer may continue inside the phase.
    pub async fn save_with_unit_progress(
        &self,
        ctx: &RunContext,
        mut checkpoint: Checkpoint,
        progress: ProgressStats,
    ) -> Result<(), PipelineError> {
        checkpoint.scene_progress = Some(progress);
        checkpoint.can_resume_within = Some(true);
        self.save(ctx, checkpoint).await
    }

    pub async fn load(
        &self,
        ctx: &RunContext,
        session_id: &SessionId,
    ) -> Result<Option<Checkpoint>, PipelineError> {
        let path = checkpoint_path(session_id);
        if !self.storage.exists(ctx, &path).await {
            return Ok(None);
        }
        let bytes = self.storage.load(ctx, &path).await?;
        let checkpoint = serde_json::from_slice(&bytes)
            .map_err(|e| PipelineError::other(format!("parse checkpoint {path}: {e}")))?;
        Ok(Some(checkpoint))
    }

    /// All stored checkpoints, in unspecified order.
    pub async fn list(&self, ctx: &RunContext) -> Result<Vec<Checkpoint>, PipelineError> {
        let keys = self.storage.list(ctx, "checkpoints/*.json").await?;
        let mut checkpoints = Vec::with_capacity(keys.len());
        for key in keys {
            let bytes = self.storage.load(ctx, &key).await?;
            match serde_json::from_slice(&bytes) {
                Ok(checkpoint) => checkpoints.push(checkpoint),
                Err(e) => warn!(key = %key, error = %e, "skipping unreadable checkpoint"),
            }
        }
        Ok(checkpoints)
    }

    pub async fn delete(
        &self,
        ctx: &RunContext,
        session_id: &SessionId,
    ) -> Result<(), PipelineError> {
        self.storage.delete(ctx, &checkpoint_path(session_id)).await
    }

    /// Bump the resume counter and stamp the resume time.
    pub async fn mark_as_resumed(
        &self,
        ctx: &RunContext,
        session_id: &SessionId,
    ) -> Result<(), PipelineError> {
        let Some(mut checkpoint) = self.load(ctx, session_id).await? else {
            return Err(PipelineError::other(format!(
                "no checkpoint for session {session_id}"
            )));
        };
        checkpoint.resume_count += 1;
        checkpoint.last_resume_time = Some(Utc::now());

        let bytes = serde_json::to_vec_pretty(&checkpoint)
            .map_err(|e| PipelineError::other(format!("serialize checkpoint: {e}")))?;
        self.storage
            .save(ctx, &checkpoint_path(session_id), &bytes)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn manager() -> (RunContext, CheckpointManager) {
        (
            RunContext::new(),
            CheckpointManager::new(Arc::new(MemoryStorage::new())),
        )
    }

    fn session() -> SessionId {
        SessionId::from_string("sess-ck")
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let (ctx, manager) = manager();
        let checkpoint = Checkpoint::new(session(), 2, "Drafting", "write a story", json!("draft"));
        manager.save(&ctx, checkpoint).await.unwrap();

        let loaded = manager.load(&ctx, &session()).await.unwrap().unwrap();
        assert_eq!(loaded.phase_index, 2);
        assert_eq!(loaded.phase_name, "Drafting");
        assert_eq!(loaded.last_output(), json!("draft"));
        assert_eq!(loaded.resume_count, 0);
    }

    #[tokio::test]
    async fn load_missing_session_returns_none() {
        let (ctx, manager) = manager();
        assert!(manager.load(&ctx, &session()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn saving_twice_keeps_one_latest_checkpoint() {
        let (ctx, manager) = manager();
        manager
            .save(&ctx, Checkpoint::new(session(), 1, "A", "req", json!(1)))
            .await
            .unwrap();
        manager
            .save(&ctx, Checkpoint::new(session(), 2, "B", "req", json!(2)))
            .await
            .unwrap();

        let all = manager.list(&ctx).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].phase_index, 2);
    }

    #[tokio::test]
    async fn phase_index_never_regresses() {
        let (ctx, manager) = manager();
        manager
            .save(&ctx, Checkpoint::new(session(), 3, "C", "req", json!(3)))
            .await
            .unwrap();
        manager
            .save(&ctx, Checkpoint::new(session(), 1, "A", "req", json!(1)))
            .await
            .unwrap();

        let loaded = manager.load(&ctx, &session()).await.unwrap().unwrap();
        assert_eq!(loaded.phase_index, 3);
    }

    #[tokio::test]
    async fn mark_as_resumed_bumps_counter() {
        let (ctx, manager) = manager();
        manager
            .save(&ctx, Checkpoint::new(session(), 1, "A", "req", json!(1)))
            .await
            .unwrap();

        manager.mark_as_resumed(&ctx, &session()).await.unwrap();
        manager.mark_as_resumed(&ctx, &session()).await.unwrap();

        let loaded = manager.load(&ctx, &session()).await.unwrap().unwrap();
        assert_eq!(loaded.resume_count, 2);
        assert!(loaded.last_resume_time.is_some());
    }

    #[tokio::test]
    async fn mark_as_resumed_without_checkpoint_errors() {
        let (ctx, manager) = manager();
        assert!(manager.mark_as_resumed(&ctx, &session()).await.is_err());
    }

    #[tokio::test]
    async fn unit_progress_merge_sets_resume_flag() {
        let (ctx, manager) = manager();
        let progress = ProgressStats::new(session(), 10);
        let checkpoint = Checkpoint::new(session(), 4, "SceneWriting", "req", json!(null));
        manager
            .save_with_unit_progress(&ctx, checkpoint, progress)
            .await
            .unwrap();

        let loaded = manager.load(&ctx, &session()).await.unwrap().unwrap();
        assert_eq!(loaded.can_resume_within, Some(true));
        assert_eq!(loaded.scene_progress.unwrap().total, 10);
    }

    #[tokio::test]
    async fn delete_removes_checkpoint() {
        let (ctx, manager) = manager();
        manager
            .save(&ctx, Checkpoint::new(session(), 1, "A", "req", json!(1)))
            .await
            .unwrap();
        manager.delete(&ctx, &session()).await.unwrap();
        assert!(manager.load(&ctx, &session()).await.unwrap().is_none());
    }
}
