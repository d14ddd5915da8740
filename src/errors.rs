//! Typed error hierarchy for the maestro orchestrator.
//!
//! Two levels cover the pipeline:
//! - `PipelineError` — classified causes (rate limit, timeout, validation, ...)
//! - `PhaseError` — a single phase's failure, wrapping cause, attempt count,
//!   and any partial output a resumer can pick up

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::phase::PhaseOutput;
use crate::verify::VerificationIssue;

/// Classified failure causes shared across the pipeline.
///
/// The variant determines retry behavior: transient causes (network, rate
/// limit, timeout, parse) are retried, terminal causes (invalid input,
/// oversized prompt, missing credentials, cancellation) abort the phase.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error("network failure: {0}")]
    Network(String),

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("failed to parse agent response: {0}")]
    Parse(String),

    #[error("input validation failed: {0}")]
    InvalidInput(String),

    #[error("output validation failed: {0}")]
    InvalidOutput(String),

    #[error("prompt too large ({chars} chars)")]
    PromptTooLarge { chars: usize },

    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("operation canceled")]
    Canceled,

    #[error("verification of stage {stage} failed with {} issue(s)", .issues.len())]
    VerificationFailed {
        stage: String,
        issues: Vec<VerificationIssue>,
    },

    #[error("storage failure at {path}: {message}")]
    Storage { path: String, message: String },

    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    /// Whether a retry could plausibly succeed.
    ///
    /// Output-validation and verification failures are retryable: the agent
    /// may produce acceptable output on the next attempt. Input validation
    /// is terminal for the phase.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. }
            | Self::Timeout { .. }
            | Self::Network(_)
            | Self::Server { .. }
            | Self::Parse(_)
            | Self::InvalidOutput(_)
            | Self::VerificationFailed { .. } => true,
            Self::InvalidInput(_)
            | Self::PromptTooLarge { .. }
            | Self::MissingCredentials(_)
            | Self::Canceled => false,
            Self::Storage { .. } | Self::Other(_) => false,
        }
    }

    /// Shorthand for a generic failure message.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    pub fn storage(path: impl Into<String>, message: impl ToString) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

/// A single phase's failure.
///
/// Carries everything a caller needs to diagnose or resume: the phase name,
/// which attempt failed, the classified cause, and partial output when the
/// phase produced something before failing.
#[derive(Debug, Error)]
#[error("phase {phase} failed on attempt {attempt}: {source}")]
pub struct PhaseError {
    /// Name of the failing phase.
    pub phase: String,
    /// Attempt number that produced the terminal error (0 = input validation).
    pub attempt: u32,
    /// Classified cause.
    #[source]
    pub source: PipelineError,
    /// Whether the cause was retryable (attempts may still have run out).
    pub retryable: bool,
    /// Output produced before the failure, if any.
    pub partial: Option<PhaseOutput>,
    /// Suggested recovery phase name, when the error handler has one.
    pub recovery_hint: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl PhaseError {
    /// Wrap a cause into a phase error with no partial output.
    pub fn new(phase: impl Into<String>, attempt: u32, source: PipelineError) -> Self {
        let retryable = source.is_retryable();
        Self {
            phase: phase.into(),
            attempt,
            source,
            retryable,
            partial: None,
            recovery_hint: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_partial(mut self, partial: PhaseOutput) -> Self {
        self.partial = Some(partial);
        self
    }

    pub fn with_recovery_hint(mut self, hint: impl Into<String>) -> Self {
        self.recovery_hint = Some(hint.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_causes_are_retryable() {
        assert!(PipelineError::RateLimited { retry_after: None }.is_retryable());
        assert!(
            PipelineError::Timeout {
                elapsed: Duration::from_secs(30)
            }
            .is_retryable()
        );
        assert!(PipelineError::Network("connection reset".into()).is_retryable());
        assert!(
            PipelineError::Server {
                status: 503,
                message: "unavailable".into()
            }
            .is_retryable()
        );
        assert!(PipelineError::Parse("truncated JSON".into()).is_retryable());
    }

    #[test]
    fn terminal_causes_are_not_retryable() {
        assert!(!PipelineError::PromptTooLarge { chars: 2_000_000 }.is_retryable());
        assert!(!PipelineError::MissingCredentials("API key".into()).is_retryable());
        assert!(!PipelineError::InvalidInput("empty request".into()).is_retryable());
        assert!(!PipelineError::Canceled.is_retryable());
    }

    #[test]
    fn output_validation_is_retryable_input_is_not() {
        assert!(PipelineError::InvalidOutput("too short".into()).is_retryable());
        assert!(!PipelineError::InvalidInput("missing data".into()).is_retryable());
    }

    #[test]
    fn phase_error_carries_attempt_and_retryability() {
        let err = PhaseError::new("Drafting", 3, PipelineError::Network("reset".into()));
        assert_eq!(err.phase, "Drafting");
        assert_eq!(err.attempt, 3);
        assert!(err.retryable);
        assert!(err.partial.is_none());
        assert!(err.to_string().contains("Drafting"));
        assert!(err.to_string().contains("attempt 3"));
    }

    #[test]
    fn phase_error_recovery_hint_is_preserved() {
        let err = PhaseError::new(
            "Drafting",
            1,
            PipelineError::Timeout {
                elapsed: Duration::from_secs(60),
            },
        )
        .with_recovery_hint("QuickGeneration");
        assert_eq!(err.recovery_hint.as_deref(), Some("QuickGeneration"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        let pipeline = PipelineError::Canceled;
        assert_std_error(&pipeline);
        let phase = PhaseError::new("x", 1, PipelineError::Canceled);
        assert_std_error(&phase);
    }
}
