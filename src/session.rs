//! Session identity and the run context threaded through every operation.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::errors::PipelineError;

/// Opaque identifier for one request's lifetime.
///
/// All checkpoints, progress files, and issue reports are keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh v4 UUID session id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix used in issue report filenames.
    pub fn short_prefix(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cancellation context passed to every blocking operation.
///
/// Wraps a `CancellationToken`; components race their waits against it so
/// cancellation at any level aborts outstanding work.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A child context canceled when this one is.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the context is canceled.
    pub async fn canceled(&self) {
        self.cancel.cancelled().await;
    }

    /// Error out immediately when the context has been canceled.
    pub fn check(&self) -> Result<(), PipelineError> {
        if self.is_canceled() {
            Err(PipelineError::Canceled)
        } else {
            Ok(())
        }
    }

    /// Cancellable sleep. Returns `Canceled` when the token fires first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), PipelineError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(PipelineError::Canceled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Run a future under a deadline, racing it against cancellation.
    ///
    /// A zero deadline still polls the future once: an immediately-ready
    /// future completes, a blocking one times out.
    pub async fn run_with_timeout<T, F>(
        &self,
        deadline: Duration,
        fut: F,
    ) -> Result<T, PipelineError>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(PipelineError::Canceled),
            out = tokio::time::timeout(deadline, fut) => {
                out.map_err(|_| PipelineError::Timeout { elapsed: deadline })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn short_prefix_is_eight_chars() {
        let id = SessionId::generate();
        assert_eq!(id.short_prefix().len(), 8);
        assert!(id.as_str().starts_with(id.short_prefix()));
    }

    #[test]
    fn short_prefix_handles_short_ids() {
        let id = SessionId::from_string("abc");
        assert_eq!(id.short_prefix(), "abc");
    }

    #[tokio::test]
    async fn sleep_is_cancellable() {
        let ctx = RunContext::new();
        let child = ctx.child();
        ctx.cancel();
        let err = child.sleep(Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Canceled));
    }

    #[tokio::test]
    async fn check_reflects_cancellation() {
        let ctx = RunContext::new();
        assert!(ctx.check().is_ok());
        ctx.cancel();
        assert!(matches!(ctx.check(), Err(PipelineError::Canceled)));
    }

    #[tokio::test]
    async fn timeout_fires_for_blocking_future() {
        let ctx = RunContext::new();
        let result = ctx
            .run_with_timeout(Duration::from_millis(10), async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
            .await;
        assert!(matches!(result, Err(PipelineError::Timeout { .. })));
    }

    #[tokio::test]
    async fn zero_timeout_still_completes_ready_future() {
        let ctx = RunContext::new();
        let result = ctx.run_with_timeout(Duration::ZERO, async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }
}
