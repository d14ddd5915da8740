//! The blob storage seam plus the two bundled backends.
//!
//! The engine persists everything (checkpoints, progress, scene content,
//! issue reports) through this narrow interface. Paths are forward-slash
//! relative keys; pattern listing uses glob syntax.
//!
//! Backends:
//! - [`FsStorage`] — directory-rooted files, tmp-file-then-rename writes
//! - [`MemoryStorage`] — in-process map, used by tests

use async_trait::async_trait;
use glob::Pattern;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

use crate::errors::PipelineError;
use crate::session::RunContext;

/// Narrow blob-store interface consumed by the engine.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn save(&self, ctx: &RunContext, path: &str, bytes: &[u8])
    -> Result<(), PipelineError>;

    async fn load(&self, ctx: &RunContext, path: &str) -> Result<Vec<u8>, PipelineError>;

    /// Keys matching a glob pattern, in unspecified order.
    async fn list(&self, ctx: &RunContext, pattern: &str) -> Result<Vec<String>, PipelineError>;

    async fn exists(&self, ctx: &RunContext, path: &str) -> bool;

    async fn delete(&self, ctx: &RunContext, path: &str) -> Result<(), PipelineError>;
}

/// Filesystem-backed storage rooted at a directory.
///
/// Saves go through a temp file in the same directory followed by a rename,
/// so an interrupted save never corrupts existing state.
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn save(
        &self,
        ctx: &RunContext,
        path: &str,
        bytes: &[u8],
    ) -> Result<(), PipelineError> {
        ctx.check()?;
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::storage(path, e))?;
        }

        let tmp = target.with_extension("tmp-write");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| PipelineError::storage(path, e))?;
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| PipelineError::storage(path, e))?;
        debug!(path, bytes = bytes.len(), "stored blob");
        Ok(())
    }

    async fn load(&self, ctx: &RunContext, path: &str) -> Result<Vec<u8>, PipelineError> {
        ctx.check()?;
        tokio::fs::read(self.resolve(path))
            .await
            .map_err(|e| PipelineError::storage(path, e))
    }

    async fn list(&self, ctx: &RunContext, pattern: &str) -> Result<Vec<String>, PipelineError> {
        ctx.check()?;
        let matcher = Pattern::new(pattern)
            .map_err(|e| PipelineError::storage(pattern, format!("bad glob: {e}")))?;

        let mut keys = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let entry_path = entry.path();
                if entry_path.is_dir() {
                    stack.push(entry_path);
                } else if let Some(key) = relative_key(&self.root, &entry_path)
                    && matcher.matches(&key)
                {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    async fn exists(&self, _ctx: &RunContext, path: &str) -> bool {
        self.resolve(path).exists()
    }

    async fn delete(&self, ctx: &RunContext, path: &str) -> Result<(), PipelineError> {
        ctx.check()?;
        tokio::fs::remove_file(self.resolve(path))
            .await
            .map_err(|e| PipelineError::storage(path, e))
    }
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    Some(rel.to_string_lossy().replace('\\', "/"))
}

/// In-memory storage for tests and short-lived runs.
#[derive(Default)]
pub struct MemoryStorage {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.read().expect("storage lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save(
        &self,
        ctx: &RunContext,
        path: &str,
        bytes: &[u8],
    ) -> Result<(), PipelineError> {
        ctx.check()?;
        self.blobs
            .write()
            .expect("storage lock")
            .insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn load(&self, ctx: &RunContext, path: &str) -> Result<Vec<u8>, PipelineError> {
        ctx.check()?;
        self.blobs
            .read()
            .expect("storage lock")
            .get(path)
            .cloned()
            .ok_or_else(|| PipelineError::storage(path, "not found"))
    }

    async fn list(&self, ctx: &RunContext, pattern: &str) -> Result<Vec<String>, PipelineError> {
        ctx.check()?;
        let matcher = Pattern::new(pattern)
            .map_err(|e| PipelineError::storage(pattern, format!("bad glob: {e}")))?;
        Ok(self
            .blobs
            .read()
            .expect("storage lock")
            .keys()
            .filter(|key| matcher.matches(key))
            .cloned()
            .collect())
    }

    async fn exists(&self, _ctx: &RunContext, path: &str) -> bool {
        self.blobs.read().expect("storage lock").contains_key(path)
    }

    async fn delete(&self, ctx: &RunContext, path: &str) -> Result<(), PipelineError> {
        ctx.check()?;
        self.blobs.write().expect("storage lock").remove(path);
        Ok(())
    }
}
