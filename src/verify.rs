//! Stage verification with retry and failure documentation.
//!
//! A stage's output runs through a registered verifier; failures are retried
//! with a backoff proportional to the attempt number. When the attempt budget
//! runs out, a JSON report lands in the per-session `issues/` directory and a
//! line is appended to the human-readable summary.
//!
//! Types:
//! - [`VerificationIssue`] / [`IssueSeverity`] — one identified problem
//! - [`StageResult`] — outcome of a verified stage, success or not
//! - [`StageVerifier`] — the retry wrapper and verifier registry
//!
//! The execution engine drives every phase attempt through
//! [`StageVerifier::verify_stage_with_retry_for`]; the plain
//! [`StageVerifier::verify_stage_with_retry`] serves free-standing stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::errors::PipelineError;
use crate::session::{RunContext, SessionId};
use crate::storage::Storage;
use crate::util::word_count;

/// Severity of a verification issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Critical,
    Major,
    Minor,
}

/// One problem a verifier identified in a stage's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationIssue {
    /// Short machine-readable issue type (e.g. `empty_output`).
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: IssueSeverity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl VerificationIssue {
    pub fn new(
        kind: impl Into<String>,
        severity: IssueSeverity,
        description: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            severity,
            description: description.into(),
            details: None,
        }
    }
}

/// Outcome of a verified stage execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: String,
    pub success: bool,
    pub attempts: u32,
    pub issues: Vec<VerificationIssue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Verifier signature: `(stage, output) -> (passed, issues)`.
pub type VerifierFn = Arc<dyn Fn(&str, &str) -> (bool, Vec<VerificationIssue>) + Send + Sync>;

/// The default verifier: output must be present.
pub fn basic_verifier() -> VerifierFn {
    Arc::new(|_stage, output| {
        if output.trim().is_empty() {
            (
                false,
                vec![VerificationIssue::new(
                    "empty_output",
                    IssueSeverity::Critical,
                    "stage produced no output",
                )],
            )
        } else {
            (true, Vec::new())
        }
    })
}

/// Planning outputs need substance and planning vocabulary.
pub fn planning_verifier() -> VerifierFn {
    const KEYWORDS: [&str; 4] = ["plan", "step", "phase", "outline"];
    Arc::new(|_stage, output| {
        let mut issues = Vec::new();
        if output.trim().is_empty() {
            issues.push(VerificationIssue::new(
                "empty_output",
                IssueSeverity::Critical,
                "planning stage produced no output",
            ));
        } else if output.len() < 100 {
            issues.push(VerificationIssue::new(
                "too_short",
                IssueSeverity::Major,
                format!("plan is only {} chars", output.len()),
            ));
        }
        let lower = output.to_lowercase();
        if !KEYWORDS.iter().any(|k| lower.contains(k)) {
            issues.push(VerificationIssue::new(
                "missing_keywords",
                IssueSeverity::Major,
                "output contains none of the expected planning keywords",
            ));
        }
        (issues.is_empty(), issues)
    })
}

/// Implementation outputs should look like code.
pub fn implementation_verifier() -> VerifierFn {
    const TOKENS: [&str; 6] = ["fn ", "def ", "func ", "class ", "impl ", "{"];
    Arc::new(|_stage, output| {
        if output.trim().is_empty() {
            return (
                false,
                vec![VerificationIssue::new(
                    "empty_output",
                    IssueSeverity::Critical,
                    "implementation stage produced no output",
                )],
            );
        }
        if TOKENS.iter().any(|t| output.contains(t)) {
            (true, Vec::new())
        } else {
            (
                false,
                vec![VerificationIssue::new(
                    "not_code",
                    IssueSeverity::Major,
                    "output contains no code-like tokens",
                )],
            )
        }
    })
}

/// Writing outputs must meet a minimum word count.
pub fn writing_verifier(min_words: usize) -> VerifierFn {
    Arc::new(move |_stage, output| {
        let words = word_count(output);
        if words >= min_words {
            (true, Vec::new())
        } else {
            (
                false,
                vec![VerificationIssue::new(
                    "below_word_count",
                    IssueSeverity::Major,
                    format!("{words} words, expected at least {min_words}"),
                )],
            )
        }
    })
}

fn stage_slug(stage: &str) -> String {
    stage
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

/// Wraps stage execution with verification, retry, and issue documentation.
///
/// The verifier is session-agnostic; the session id travels with each call
/// so one long-lived instance serves every run.
pub struct StageVerifier {
    storage: Arc<dyn Storage>,
    retry_limit: u32,
    backoff_unit: Duration,
    verifiers: RwLock<HashMap<String, VerifierFn>>,
}

impl StageVerifier {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        let verifier = Self {
            storage,
            retry_limit: 3,
            backoff_unit: Duration::from_secs(1),
            verifiers: RwLock::new(HashMap::new()),
        };
        verifier.register("Planning", planning_verifier());
        verifier.register("Implementation", implementation_verifier());
        verifier.register("Writing", writing_verifier(100));
        verifier
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit.max(1);
        self
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Register (or replace) a verifier for a stage.
    pub fn register(&self, stage: impl Into<String>, verifier: VerifierFn) {
        self.verifiers
            .write()
            .expect("verifier lock")
            .insert(stage.into(), verifier);
    }

    fn verifier_for(&self, stage: &str) -> VerifierFn {
        self.verifiers
            .read()
            .expect("verifier lock")
            .get(stage)
            .cloned()
            .unwrap_or_else(basic_verifier)
    }

    /// Run a stage up to `retry_limit` times, verifying each attempt's
    /// output. Returns a `StageResult` on success and on exhausted failure;
    /// callers inspect `success`. A terminal (non-retryable) execution error
    /// stops the loop early.
    pub async fn verify_stage_with_retry<F, Fut>(
        &self,
        ctx: &RunContext,
        session_id: &SessionId,
        stage: &str,
        execute: F,
    ) -> Result<StageResult, PipelineError>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<String, PipelineError>>,
    {
        self.verify_stage_with_retry_for(ctx, session_id, stage, execute, |e| e.is_retryable())
            .await
    }

    /// [`Self::verify_stage_with_retry`] with a caller-supplied retryability
    /// predicate. The execution engine passes the phase's own `can_retry`
    /// here so a phase can veto retries the error class would allow.
    pub async fn verify_stage_with_retry_for<F, Fut, P>(
        &self,
        ctx: &RunContext,
        session_id: &SessionId,
        stage: &str,
        execute: F,
        retryable: P,
    ) -> Result<StageResult, PipelineError>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<String, PipelineError>>,
        P: Fn(&PipelineError) -> bool,
    {
        let verifier = self.verifier_for(stage);
        let started = Instant::now();
        let mut last_issues = Vec::new();
        let mut last_output = None;
        let mut attempts = 0;

        for attempt in 1..=self.retry_limit {
            ctx.check()?;
            attempts = attempt;
            debug!(stage, attempt, "verifying stage attempt");

            match execute(attempt).await {
                Ok(output) => {
                    let (passed, issues) = verifier(stage, &output);
                    if passed {
                        info!(stage, attempt, "stage verified");
                        return Ok(StageResult {
                            stage: stage.to_string(),
                            success: true,
                            attempts: attempt,
                            issues: Vec::new(),
                            output: Some(output),
                            duration_ms: started.elapsed().as_millis() as u64,
                            timestamp: Utc::now(),
                            metadata: HashMap::new(),
                        });
                    }
                    warn!(stage, attempt, issues = issues.len(), "verification failed");
                    last_issues = issues;
                    last_output = Some(output);
                }
                Err(e) => {
                    let terminal = !retryable(&e);
                    last_issues = vec![VerificationIssue::new(
                        "execution_error",
                        IssueSeverity::Critical,
                        e.to_string(),
                    )];
                    last_output = None;
                    if terminal {
                        warn!(stage, attempt, error = %e, "terminal stage error");
                        break;
                    }
                }
            }

            if attempt < self.retry_limit {
                ctx.sleep(self.backoff_unit * attempt).await?;
            }
        }

        let result = StageResult {
            stage: stage.to_string(),
            success: false,
            attempts,
            issues: last_issues,
            output: last_output,
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        };
        self.document_failure(ctx, session_id, &result).await?;
        Ok(result)
    }

    /// Persist the JSON report and append the markdown summary line.
    async fn document_failure(
        &self,
        ctx: &RunContext,
        session_id: &SessionId,
        result: &StageResult,
    ) -> Result<(), PipelineError> {
        let prefix = session_id.short_prefix();
        let slug = stage_slug(&result.stage);
        let stamp = result.timestamp.format("%Y%m%d-%H%M%S");
        let report_path = format!("issues/{prefix}-{slug}-{stamp}.json");

        let report = serde_json::json!({
            "session_id": session_id,
            "stage": result.stage,
            "timestamp": result.timestamp,
            "attempts": result.attempts,
            "duration_ms": result.duration_ms,
            "issues": result.issues,
            "metadata": result.metadata,
            "output": result.output,
        });
        let bytes = serde_json::to_vec_pretty(&report)
            .map_err(|e| PipelineError::other(format!("serialize issue report: {e}")))?;
        self.storage.save(ctx, &report_path, &bytes).await?;

        let summary_path = format!("issues/{prefix}-summary.md");
        let mut summary = if self.storage.exists(ctx, &summary_path).await {
            String::from_utf8(self.storage.load(ctx, &summary_path).await?)
                .unwrap_or_default()
        } else {
            format!("# Stage failures for session {session_id}\n")
        };
        summary.push_str(&format!(
            "\n## {} at {}\n\n- attempts: {}\n- duration: {}ms\n",
            result.stage,
            result.timestamp.to_rfc3339(),
            result.attempts,
            result.duration_ms,
        ));
        for issue in &result.issues {
            summary.push_str(&format!(
                "- [{:?}] {}: {}\n",
                issue.severity, issue.kind, issue.description
            ));
        }
        self.storage.save(ctx, &summary_path, summary.as_bytes()).await
    }
}
