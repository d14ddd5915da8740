//! Iterative improvement: criteria, inspectors, and the improve loop.
//!
//! - [`QualityCriteria`] / [`CriteriaResult`] — one scored quality check
//! - [`Inspector`] — a pluggable content examiner producing criteria scores
//! - [`ImprovementEngine`] — the inspect → improve → re-inspect loop

mod engine;

pub use engine::{
    ImprovementCheckpoint, ImprovementEngine, ImprovementSession, ImprovementStep, ImproveStrategy,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::errors::PipelineError;
use crate::session::RunContext;

/// Priority of a quality criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CriteriaPriority {
    Critical,
    High,
    Medium,
    Low,
}

/// Outcome of evaluating one criterion against content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriteriaResult {
    pub passed: bool,
    /// In [0, 1].
    pub score: f64,
    pub details: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub evidence: Vec<String>,
}

impl CriteriaResult {
    pub fn pass(score: f64, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            score: score.clamp(0.0, 1.0),
            details: details.into(),
            suggestions: Vec::new(),
            evidence: Vec::new(),
        }
    }

    pub fn fail(score: f64, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            score: score.clamp(0.0, 1.0),
            details: details.into(),
            suggestions: Vec::new(),
            evidence: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Validator signature for a criterion.
pub type CriteriaValidator = Arc<dyn Fn(&str) -> CriteriaResult + Send + Sync>;

/// A single quality check.
#[derive(Clone)]
pub struct QualityCriteria {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub priority: CriteriaPriority,
    pub validator: CriteriaValidator,
}

impl QualityCriteria {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        category: impl Into<String>,
        priority: CriteriaPriority,
        validator: CriteriaValidator,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            category: category.into(),
            priority,
            validator,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl std::fmt::Debug for QualityCriteria {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QualityCriteria")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("priority", &self.priority)
            .finish()
    }
}

/// One criterion's outcome inside an inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriteriaOutcome {
    pub id: String,
    pub name: String,
    pub priority: CriteriaPriority,
    pub result: CriteriaResult,
}

/// What an inspector found in one pass over the content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectionResult {
    pub inspector: String,
    pub category: String,
    /// Mean criterion score, in [0, 1].
    pub score: f64,
    pub criteria: Vec<CriteriaOutcome>,
    pub timestamp: DateTime<Utc>,
}

/// A pluggable content examiner.
#[async_trait]
pub trait Inspector: Send + Sync {
    fn name(&self) -> &str;

    fn category(&self) -> &str;

    fn can_inspect(&self, _content: &str) -> bool {
        true
    }

    fn generate_criteria(&self) -> Vec<QualityCriteria>;

    /// Evaluate all generated criteria and average their scores.
    async fn inspect(
        &self,
        ctx: &RunContext,
        content: &str,
    ) -> Result<InspectionResult, PipelineError> {
        ctx.check()?;
        let criteria = self.generate_criteria();
        let mut outcomes = Vec::with_capacity(criteria.len());
        let mut total = 0.0;
        for criterion in &criteria {
            let result = (criterion.validator)(content);
            total += result.score;
            outcomes.push(CriteriaOutcome {
                id: criterion.id.clone(),
                name: criterion.name.clone(),
                priority: criterion.priority,
                result,
            });
        }
        let score = if outcomes.is_empty() {
            1.0
        } else {
            total / outcomes.len() as f64
        };
        Ok(InspectionResult {
            inspector: self.name().to_string(),
            category: self.category().to_string(),
            score,
            criteria: outcomes,
            timestamp: Utc::now(),
        })
    }
}
