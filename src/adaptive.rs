//! Adaptive error handling with learned recovery.
//!
//! Errors are classified by keyword, matched against learned patterns, and
//! handed recovery strategies ordered by confidence. Every recovery attempt
//! feeds back into the pattern store; chronically failing patterns tighten
//! the handler's retry thresholds.
//!
//! Core types:
//! - [`FailureKind`] — closed classification of failures
//! - [`AdaptiveError`] — a classified error plus its recovery hints
//! - [`RecoveryStrategy`] / [`RecoveryAction`] — a confidence-ranked fix
//! - [`LearnedPattern`] — per-signature success/failure history

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::PipelineError;
use crate::session::RunContext;

const MAX_HISTORY: usize = 10_000;
const LEARNED_UPGRADE_RATE: f64 = 0.8;
const MIN_HINT_CONFIDENCE: f64 = 0.3;

/// Closed classification of failure causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Momentary failures expected to clear on retry.
    Transient,
    /// Failures a learned recovery strategy has handled before.
    Adaptable,
    /// Misconfiguration: missing keys, bad endpoints.
    Config,
    /// Resource exhaustion: memory, disk, quota.
    Resource,
    /// Input or output shape problems.
    Validation,
    Unknown,
}

/// An executable fix for a failing state.
#[async_trait]
pub trait RecoveryAction: Send + Sync {
    async fn run(&self, ctx: &RunContext, data: Value) -> Result<Value, PipelineError>;
}

/// A named, confidence-ranked recovery strategy.
#[derive(Clone)]
pub struct RecoveryStrategy {
    pub name: String,
    pub description: String,
    /// In [0, 1]; hints below 0.3 are skipped.
    pub confidence: f64,
    pub action: Arc<dyn RecoveryAction>,
    /// Informal applicability conditions, recorded for reports.
    pub conditions: Vec<String>,
}

impl RecoveryStrategy {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        confidence: f64,
        action: Arc<dyn RecoveryAction>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            confidence: confidence.clamp(0.0, 1.0),
            action,
            conditions: Vec::new(),
        }
    }
}

impl std::fmt::Debug for RecoveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryStrategy")
            .field("name", &self.name)
            .field("confidence", &self.confidence)
            .finish()
    }
}

/// A classified error with context and recovery hints.
#[derive(Debug, Clone)]
pub struct AdaptiveError {
    pub kind: FailureKind,
    pub message: String,
    pub context: HashMap<String, String>,
    pub recovery_hints: Vec<RecoveryStrategy>,
    pub signature: String,
    pub timestamp: DateTime<Utc>,
    /// Rendered source chain of the original error.
    pub frames: Vec<String>,
}

/// One recorded recovery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub strategy: String,
    pub success: bool,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Per-signature learning state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedPattern {
    pub signature: String,
    pub successful_fixes: Vec<AttemptRecord>,
    pub failed_attempts: Vec<AttemptRecord>,
    pub success_rate: f64,
    pub last_updated: DateTime<Utc>,
}

impl LearnedPattern {
    fn new(signature: String) -> Self {
        Self {
            signature,
            successful_fixes: Vec::new(),
            failed_attempts: Vec::new(),
            success_rate: 0.0,
            last_updated: Utc::now(),
        }
    }

    fn record(&mut self, attempt: AttemptRecord) {
        if attempt.success {
            self.successful_fixes.push(attempt);
        } else {
            self.failed_attempts.push(attempt);
        }
        let total = self.successful_fixes.len() + self.failed_attempts.len();
        self.success_rate = if total == 0 {
            0.0
        } else {
            self.successful_fixes.len() as f64 / total as f64
        };
        self.last_updated = Utc::now();
    }
}

/// Retry thresholds the handler adapts as patterns accumulate failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveThresholds {
    pub retry_limit: u32,
    pub backoff_factor: f64,
}

impl Default for AdaptiveThresholds {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            backoff_factor: 1.0,
        }
    }
}

/// Stable signature for an error message: lowercased, digits masked.
pub fn error_signature(message: &str) -> String {
    let masked: String = message
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_digit() { '#' } else { c })
        .collect();
    masked.chars().take(120).collect()
}

fn classify_message(message: &str) -> FailureKind {
    let lower = message.to_lowercase();
    const TRANSIENT: [&str; 7] = [
        "timeout",
        "timed out",
        "connection",
        "network",
        "rate limit",
        "503",
        "502",
    ];
    const CONFIG: [&str; 4] = ["config", "credential", "api key", "unauthorized"];
    const RESOURCE: [&str; 4] = ["memory", "disk", "quota", "resource"];
    const VALIDATION: [&str; 4] = ["invalid", "validation", "parse", "schema"];

    if TRANSIENT.iter().any(|k| lower.contains(k)) {
        FailureKind::Transient
    } else if CONFIG.iter().any(|k| lower.contains(k)) {
        FailureKind::Config
    } else if RESOURCE.iter().any(|k| lower.contains(k)) {
        FailureKind::Resource
    } else if VALIDATION.iter().any(|k| lower.contains(k)) {
        FailureKind::Validation
    } else {
        FailureKind::Unknown
    }
}

/// Retained for request-type error counts and post-run inspection.
#[allow(dead_code)]
struct HistoryEntry {
    signature: String,
    kind: FailureKind,
    context: HashMap<String, String>,
    timestamp: DateTime<Utc>,
}

/// Classifies errors, suggests recovery, and learns from outcomes.
pub struct AdaptiveErrorHandler {
    patterns: RwLock<HashMap<String, LearnedPattern>>,
    history: RwLock<Vec<HistoryEntry>>,
    hints: RwLock<HashMap<FailureKind, Vec<RecoveryStrategy>>>,
    thresholds: Mutex<AdaptiveThresholds>,
}

impl Default for AdaptiveErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptiveErrorHandler {
    pub fn new() -> Self {
        Self {
            patterns: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
            hints: RwLock::new(HashMap::new()),
            thresholds: Mutex::new(AdaptiveThresholds::default()),
        }
    }

    /// Register a recovery strategy offered for a failure kind.
    pub fn register_hint(&self, kind: FailureKind, strategy: RecoveryStrategy) {
        self.hints
            .write()
            .expect("hints lock")
            .entry(kind)
            .or_default()
            .push(strategy);
    }

    pub fn thresholds(&self) -> AdaptiveThresholds {
        *self.thresholds.lock().expect("thresholds lock")
    }

    /// Errors recorded whose context carried this `request_type`.
    pub fn error_count_for_request_type(&self, request_type: &str) -> usize {
        self.history
            .read()
            .expect("history lock")
            .iter()
            .filter(|entry| entry.context.get("request_type").map(String::as_str) == Some(request_type))
            .count()
    }

    /// Classify an error and attach recovery hints.
    ///
    /// A learned pattern with a success rate above 0.8 upgrades the
    /// classification to `Adaptable`: past recoveries make this failure
    /// actionable regardless of its surface keywords.
    pub fn handle(&self, err: &PipelineError, context: HashMap<String, String>) -> AdaptiveError {
        let message = err.to_string();
        let signature = error_signature(&message);
        let mut kind = classify_message(&message);

        {
            let patterns = self.patterns.read().expect("patterns lock");
            if let Some(pattern) = patterns.get(&signature)
                && pattern.success_rate > LEARNED_UPGRADE_RATE
            {
                debug!(signature = %signature, rate = pattern.success_rate, "upgrading to adaptable");
                kind = FailureKind::Adaptable;
            }
        }

        let mut frames = Vec::new();
        let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(err);
        while let Some(cause) = source {
            frames.push(cause.to_string());
            source = cause.source();
        }

        let recovery_hints = {
            let hints = self.hints.read().expect("hints lock");
            let mut all: Vec<RecoveryStrategy> = hints.get(&kind).cloned().unwrap_or_default();
            if kind == FailureKind::Adaptable {
                // Adaptable errors may also use the hints of their surface kind.
                let surface = classify_message(&message);
                all.extend(hints.get(&surface).cloned().unwrap_or_default());
            }
            all
        };

        {
            let mut history = self.history.write().expect("history lock");
            history.push(HistoryEntry {
                signature: signature.clone(),
                kind,
                context: context.clone(),
                timestamp: Utc::now(),
            });
            if history.len() > MAX_HISTORY {
                let keep_from = history.len() - MAX_HISTORY / 2;
                history.drain(..keep_from);
            }
        }

        AdaptiveError {
            kind,
            message,
            context,
            recovery_hints,
            signature,
            timestamp: Utc::now(),
            frames,
        }
    }

    /// Attempt recovery strategies in confidence order, learning from each
    /// outcome. Strategies below 0.3 confidence are skipped. Returns the
    /// recovered data on first success.
    pub async fn recover_with_learning(
        &self,
        ctx: &RunContext,
        err: &AdaptiveError,
        data: Value,
    ) -> Result<Value, PipelineError> {
        let mut hints = err.recovery_hints.clone();
        hints.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let mut last_err =
            PipelineError::other(format!("no viable recovery for: {}", err.message));

        for hint in hints {
            if hint.confidence < MIN_HINT_CONFIDENCE {
                debug!(strategy = %hint.name, confidence = hint.confidence, "skipping low-confidence hint");
                continue;
            }
            ctx.check()?;

            let started = Instant::now();
            let outcome = hint.action.run(ctx, data.clone()).await;
            let attempt = AttemptRecord {
                strategy: hint.name.clone(),
                success: outcome.is_ok(),
                duration_ms: started.elapsed().as_millis() as u64,
                timestamp: Utc::now(),
            };
            self.record_attempt(&err.signature, attempt);

            match outcome {
                Ok(value) => {
                    info!(strategy = %hint.name, signature = %err.signature, "recovery succeeded");
                    return Ok(value);
                }
                Err(e) => {
                    warn!(strategy = %hint.name, error = %e, "recovery attempt failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Snapshot of a learned pattern, for tests and reports.
    pub fn pattern(&self, signature: &str) -> Option<LearnedPattern> {
        self.patterns
            .read()
            .expect("patterns lock")
            .get(signature)
            .cloned()
    }

    fn record_attempt(&self, signature: &str, attempt: AttemptRecord) {
        let (success_rate, failures) = {
            let mut patterns = self.patterns.write().expect("patterns lock");
            let pattern = patterns
                .entry(signature.to_string())
                .or_insert_with(|| LearnedPattern::new(signature.to_string()));
            pattern.record(attempt);
            (pattern.success_rate, pattern.failed_attempts.len())
        };

        // Chronically failing patterns tighten the thresholds.
        if success_rate < 0.3 && failures > 5 {
            let mut thresholds = self.thresholds.lock().expect("thresholds lock");
            thresholds.retry_limit = thresholds.retry_limit.saturating_sub(1).max(1);
            thresholds.backoff_factor = (thresholds.backoff_factor * 1.2).min(5.0);
            warn!(
                signature,
                retry_limit = thresholds.retry_limit,
                backoff_factor = thresholds.backoff_factor,
                "adapted thresholds after repeated failures"
            );
        }
    }
}
