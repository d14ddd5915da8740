//! Unit-level progress tracking for long streaming phases.
//!
//! A streaming phase (e.g. a scene writer) produces many independent units.
//! The tracker records per-unit success/failure, stores each unit's content
//! under `scenes/<key>`, and keeps one progress file per session. Every
//! mutation is persisted before it returns, and a unit's transition to
//! completed is observed together with its content blob.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::errors::PipelineError;
use crate::session::{RunContext, SessionId};
use crate::storage::Storage;

/// A successfully produced unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedUnit {
    pub content: String,
    pub completed_at: DateTime<Utc>,
}

/// A failed unit attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedUnit {
    pub attempt: u32,
    pub error: String,
    pub retryable: bool,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot of a streaming session's unit progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressStats {
    pub session_id: SessionId,
    pub total: usize,
    pub completed: HashMap<String, CompletedUnit>,
    pub failed: HashMap<String, FailedUnit>,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl ProgressStats {
    pub fn new(session_id: SessionId, total: usize) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            total,
            completed: HashMap::new(),
            failed: HashMap::new(),
            start_time: now,
            last_update: now,
        }
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.completed.len() >= self.total
    }
}

/// Deterministic unit key for a chapter/scene pair.
pub fn unit_key(chapter: usize, scene: usize) -> String {
    format!("chapter_{chapter}_scene_{scene}")
}

fn progress_path(session_id: &SessionId) -> String {
    format!("progress/writing_progress_{session_id}.json")
}

fn scene_path(key: &str) -> String {
    format!("scenes/{key}")
}

/// Storage-backed tracker for a single streaming session.
///
/// One exclusive lock guards mutations; reads take the shared side. The lock
/// is held across the persist so two racing mutations cannot write stale
/// snapshots over each other.
pub struct ProgressTracker {
    storage: Arc<dyn Storage>,
    state: RwLock<ProgressStats>,
}

impl ProgressTracker {
    pub fn new(storage: Arc<dyn Storage>, session_id: SessionId, total: usize) -> Self {
        Self {
            storage,
            state: RwLock::new(ProgressStats::new(session_id, total)),
        }
    }

    /// Resume from a persisted progress file, or start fresh.
    pub async fn load_or_new(
        ctx: &RunContext,
        storage: Arc<dyn Storage>,
        session_id: SessionId,
        total: usize,
    ) -> Result<Self, PipelineError> {
        let path = progress_path(&session_id);
        if storage.exists(ctx, &path).await {
            let bytes = storage.load(ctx, &path).await?;
            match serde_json::from_slice::<ProgressStats>(&bytes) {
                Ok(stats) => {
                    debug!(
                        session = %session_id,
                        completed = stats.completed_count(),
                        "resumed unit progress"
                    );
                    return Ok(Self {
                        storage,
                        state: RwLock::new(stats),
                    });
                }
                Err(e) => {
                    warn!(session = %session_id, error = %e, "progress file unreadable, starting fresh");
                }
            }
        }
        Ok(Self::new(storage, session_id, total))
    }

    /// Record a successful unit. The content blob is stored first, then the
    /// progress file; any prior failure record for the key is removed.
    /// Re-marking an already-completed unit overwrites its content.
    pub async fn mark_completed(
        &self,
        ctx: &RunContext,
        key: &str,
        content: &str,
    ) -> Result<(), PipelineError> {
        let mut state = self.state.write().await;
        if !state.completed.contains_key(key)
            && !state.failed.contains_key(key)
            && state.completed.len() + state.failed.len() >= state.total
        {
            return Err(PipelineError::other(format!(
                "unit {key} would exceed declared total {}",
                state.total
            )));
        }

        self.storage
            .save(ctx, &scene_path(key), content.as_bytes())
            .await?;

        state.failed.remove(key);
        state.completed.insert(
            key.to_string(),
            CompletedUnit {
                content: content.to_string(),
                completed_at: Utc::now(),
            },
        );
        state.last_update = Utc::now();
        self.persist(ctx, &state).await
    }

    /// Record a failed unit attempt. A later success replaces the record.
    pub async fn mark_failed(
        &self,
        ctx: &RunContext,
        key: &str,
        attempt: u32,
        error: &str,
        retryable: bool,
    ) -> Result<(), PipelineError> {
        let mut state = self.state.write().await;
        if state.completed.contains_key(key) {
            // A completed unit stays completed; stale failure reports from
            // racing retries are dropped.
            return Ok(());
        }
        if !state.failed.contains_key(key)
            && state.completed.len() + state.failed.len() >= state.total
        {
            return Err(PipelineError::other(format!(
                "unit {key} would exceed declared total {}",
                state.total
            )));
        }

        state.failed.insert(
            key.to_string(),
            FailedUnit {
                attempt,
                error: error.to_string(),
                retryable,
                timestamp: Utc::now(),
            },
        );
        state.last_update = Utc::now();
        self.persist(ctx, &state).await
    }

    /// Current snapshot.
    pub async fn stats(&self) -> ProgressStats {
        self.state.read().await.clone()
    }

    /// Load a unit's stored content.
    pub async fn unit_content(
        &self,
        ctx: &RunContext,
        key: &str,
    ) -> Result<String, PipelineError> {
        let bytes = self.storage.load(ctx, &scene_path(key)).await?;
        String::from_utf8(bytes).map_err(|e| PipelineError::storage(scene_path(key), e))
    }

    async fn persist(&self, ctx: &RunContext, state: &ProgressStats) -> Result<(), PipelineError> {
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| PipelineError::other(format!("serialize progress: {e}")))?;
        self.storage
            .save(ctx, &progress_path(&state.session_id), &bytes)
            .await
    }
}
