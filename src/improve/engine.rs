//! The inspect → plan → improve → re-inspect loop.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{CriteriaOutcome, CriteriaPriority, InspectionResult, Inspector};
use crate::agent::Agent;
use crate::config::{FocusMode, ImprovementConfig};
use crate::errors::PipelineError;
use crate::session::RunContext;
use crate::storage::Storage;
use crate::util::word_count;

/// Cumulative improvement below this fraction across the stagnation window
/// counts as stagnation.
const STAGNATION_EPSILON: f64 = 0.01;

/// How the engine attacks the current failing criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImproveStrategy {
    /// Only critical-priority failures.
    FocusCritical,
    /// A batch of failures at once.
    BatchImprovements,
    /// Rework everything failing; used when the same targets keep recurring.
    AggressiveRefactor,
    /// One failure at a time.
    Incremental,
}

impl ImproveStrategy {
    fn as_str(&self) -> &'static str {
        match self {
            Self::FocusCritical => "focus-critical",
            Self::BatchImprovements => "batch-improvements",
            Self::AggressiveRefactor => "aggressive-refactor",
            Self::Incremental => "incremental",
        }
    }
}

/// One improvement attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementStep {
    pub iteration: u32,
    pub strategy: ImproveStrategy,
    pub quality_before: f64,
    pub quality_after: f64,
    pub accepted: bool,
    /// Criterion ids targeted this step.
    pub targets: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// Periodic snapshot of the loop's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementCheckpoint {
    pub iteration: u32,
    pub quality: f64,
    pub content_words: usize,
    pub timestamp: DateTime<Utc>,
}

/// Full record of one improvement run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementSession {
    pub id: String,
    pub final_content: String,
    pub final_quality: f64,
    pub target_quality: f64,
    pub success: bool,
    pub reason: String,
    pub steps: Vec<ImprovementStep>,
    pub checkpoints: Vec<ImprovementCheckpoint>,
    /// Per-criterion score history across iterations.
    pub criteria_evolution: HashMap<String, Vec<f64>>,
    /// Patterns observed often enough to matter (applied more than twice).
    pub insights: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
}

/// Inspect-plan-improve loop over registered inspectors.
pub struct ImprovementEngine {
    config: ImprovementConfig,
    agent: Arc<dyn Agent>,
    inspectors: Vec<Arc<dyn Inspector>>,
    storage: Option<Arc<dyn Storage>>,
}

impl ImprovementEngine {
    pub fn new(config: ImprovementConfig, agent: Arc<dyn Agent>) -> Self {
        Self {
            config,
            agent,
            inspectors: Vec::new(),
            storage: None,
        }
    }

    /// Persist session logs under `improvement/` through this storage.
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn register_inspector(&mut self, inspector: Arc<dyn Inspector>) {
        self.inspectors.push(inspector);
    }

    pub fn inspector_count(&self) -> usize {
        self.inspectors.len()
    }

    /// Run all applicable inspectors over the content. Concurrent when
    /// configured; results are merged only once the whole batch completes.
    pub async fn inspect_all(
        &self,
        ctx: &RunContext,
        content: &str,
    ) -> Result<Vec<InspectionResult>, PipelineError> {
        let applicable: Vec<&Arc<dyn Inspector>> = self
            .inspectors
            .iter()
            .filter(|i| i.can_inspect(content))
            .collect();

        if self.config.parallel_criteria {
            let futures: Vec<_> = applicable
                .iter()
                .map(|inspector| inspector.inspect(ctx, content))
                .collect();
            join_all(futures).await.into_iter().collect()
        } else {
            let mut results = Vec::with_capacity(applicable.len());
            for inspector in applicable {
                results.push(inspector.inspect(ctx, content).await?);
            }
            Ok(results)
        }
    }

    /// Improve toward the configured target quality.
    pub async fn improve_to_default(
        &self,
        ctx: &RunContext,
        content: &str,
    ) -> Result<ImprovementSession, PipelineError> {
        self.improve(ctx, content, self.config.target_quality).await
    }

    /// Improve `content` until `target_quality` is reached (within the
    /// convergence threshold) or the iteration budget runs out. Accepted
    /// steps never decrease quality; rejected candidates leave the content
    /// untouched.
    pub async fn improve(
        &self,
        ctx: &RunContext,
        content: &str,
        target_quality: f64,
    ) -> Result<ImprovementSession, PipelineError> {
        let mut session = ImprovementSession {
            id: Uuid::new_v4().to_string(),
            final_content: content.to_string(),
            final_quality: 0.0,
            target_quality,
            success: false,
            reason: String::new(),
            steps: Vec::new(),
            checkpoints: Vec::new(),
            criteria_evolution: HashMap::new(),
            insights: Vec::new(),
            log_path: None,
        };

        let mut current = content.to_string();
        let mut relaxed: HashSet<String> = HashSet::new();
        let mut strategy_counts: HashMap<ImproveStrategy, u32> = HashMap::new();
        let mut prev_targets: Vec<String> = Vec::new();
        let mut recent: VecDeque<f64> = VecDeque::new();
        let mut last_overall = 0.0;

        for iteration in 1..=self.config.max_iterations {
            ctx.check()?;

            let inspections = self.inspect_all(ctx, &current).await?;
            let overall = overall_quality(&inspections);
            last_overall = overall;
            record_evolution(&mut session.criteria_evolution, &inspections);

            if overall >= target_quality - self.config.convergence_threshold {
                session.success = true;
                session.reason = format!("target quality {target_quality} reached");
                break;
            }

            let mut failing = failing_criteria(&inspections, &relaxed);
            if failing.is_empty() {
                session.reason = "all criteria passing but overall quality below target".into();
                break;
            }

            let strategy = self.select_strategy(&failing, &prev_targets);
            *strategy_counts.entry(strategy).or_default() += 1;
            self.order_failing(&mut failing);
            let targets = self.pick_targets(strategy, &failing);
            let target_ids: Vec<String> = targets.iter().map(|o| o.id.clone()).collect();
            debug!(
                iteration,
                overall,
                strategy = strategy.as_str(),
                targets = target_ids.len(),
                "improvement step"
            );

            let prompt = improvement_prompt(&current, strategy, &targets);
            let candidate = self.agent.execute(ctx, &prompt, None).await?;
            let candidate_quality =
                overall_quality(&self.inspect_all(ctx, &candidate).await?);

            let accepted = candidate_quality > overall + self.config.min_improvement;
            if accepted {
                current = candidate;
                last_overall = candidate_quality;
            }

            session.steps.push(ImprovementStep {
                iteration,
                strategy,
                quality_before: overall,
                quality_after: candidate_quality,
                accepted,
                targets: target_ids.clone(),
                timestamp: Utc::now(),
            });
            prev_targets = target_ids;

            if iteration % self.config.checkpoint_interval.max(1) == 0 {
                session.checkpoints.push(ImprovementCheckpoint {
                    iteration,
                    quality: last_overall,
                    content_words: word_count(&current),
                    timestamp: Utc::now(),
                });
            }

            if accepted && candidate_quality >= target_quality - self.config.convergence_threshold {
                session.success = true;
                session.reason = format!("target quality {target_quality} reached");
                break;
            }

            recent.push_back(last_overall);
            if recent.len() > self.config.stagnation_threshold.max(1) {
                recent.pop_front();
            }
            if recent.len() == self.config.stagnation_threshold.max(1) {
                let window_gain = recent.back().unwrap() - recent.front().unwrap();
                if window_gain < STAGNATION_EPSILON {
                    if self.config.adaptive_learning {
                        let newly_relaxed = relax_non_critical(&failing, &mut relaxed);
                        warn!(
                            iteration,
                            relaxed = newly_relaxed,
                            "stagnation detected, relaxing non-critical criteria"
                        );
                        session.insights.push(format!(
                            "stagnated at quality {last_overall:.2}; relaxed {newly_relaxed} non-critical criteria"
                        ));
                        recent.clear();
                        if newly_relaxed == 0 {
                            session.reason =
                                "stagnated with only critical criteria failing".into();
                            break;
                        }
                    } else {
                        session.reason = format!(
                            "stagnated: <1% improvement across {} steps",
                            self.config.stagnation_threshold
                        );
                        break;
                    }
                }
            }
        }

        if session.reason.is_empty() {
            session.reason = format!(
                "iteration budget of {} exhausted",
                self.config.max_iterations
            );
        }
        session.final_content = current;
        session.final_quality = last_overall;

        for (strategy, count) in &strategy_counts {
            if *count > 2 {
                session
                    .insights
                    .push(format!("strategy {} applied {count} times", strategy.as_str()));
            }
        }

        if let Some(storage) = &self.storage {
            let path = format!("improvement/{}.json", session.id);
            let bytes = serde_json::to_vec_pretty(&session)
                .map_err(|e| PipelineError::other(format!("serialize improvement log: {e}")))?;
            storage.save(ctx, &path, &bytes).await?;
            session.log_path = Some(path);
        }

        info!(
            success = session.success,
            quality = session.final_quality,
            steps = session.steps.len(),
            "improvement session finished"
        );
        Ok(session)
    }

    /// Recurring targets trump everything; then critical failures, then
    /// batch size, then one-at-a-time.
    fn select_strategy(
        &self,
        failing: &[CriteriaOutcome],
        prev_targets: &[String],
    ) -> ImproveStrategy {
        let recurring = failing
            .iter()
            .filter(|o| prev_targets.contains(&o.id))
            .count();
        if !prev_targets.is_empty() && recurring * 2 > failing.len() {
            ImproveStrategy::AggressiveRefactor
        } else if failing
            .iter()
            .any(|o| o.priority == CriteriaPriority::Critical)
        {
            ImproveStrategy::FocusCritical
        } else if failing.len() > 5 {
            ImproveStrategy::BatchImprovements
        } else {
            ImproveStrategy::Incremental
        }
    }

    fn order_failing(&self, failing: &mut [CriteriaOutcome]) {
        match self.config.focus_mode {
            FocusMode::WorstFirst => {
                failing.sort_by(|a, b| a.result.score.total_cmp(&b.result.score));
            }
            FocusMode::Priority => failing.sort_by_key(|o| o.priority),
            FocusMode::Random => {}
        }
    }

    fn pick_targets(
        &self,
        strategy: ImproveStrategy,
        failing: &[CriteriaOutcome],
    ) -> Vec<CriteriaOutcome> {
        match strategy {
            ImproveStrategy::FocusCritical => failing
                .iter()
                .filter(|o| o.priority == CriteriaPriority::Critical)
                .cloned()
                .collect(),
            ImproveStrategy::BatchImprovements => failing
                .iter()
                .take(self.config.batch_size.max(1))
                .cloned()
                .collect(),
            ImproveStrategy::AggressiveRefactor => failing.to_vec(),
            ImproveStrategy::Incremental => failing.iter().take(1).cloned().collect(),
        }
    }
}

fn overall_quality(inspections: &[InspectionResult]) -> f64 {
    if inspections.is_empty() {
        return 1.0;
    }
    inspections.iter().map(|r| r.score).sum::<f64>() / inspections.len() as f64
}

fn record_evolution(
    evolution: &mut HashMap<String, Vec<f64>>,
    inspections: &[InspectionResult],
) {
    for inspection in inspections {
        for outcome in &inspection.criteria {
            evolution
                .entry(outcome.id.clone())
                .or_default()
                .push(outcome.result.score);
        }
    }
}

fn failing_criteria(
    inspections: &[InspectionResult],
    relaxed: &HashSet<String>,
) -> Vec<CriteriaOutcome> {
    inspections
        .iter()
        .flat_map(|r| r.criteria.iter())
        .filter(|o| !o.result.passed && !relaxed.contains(&o.id))
        .cloned()
        .collect()
}

fn relax_non_critical(failing: &[CriteriaOutcome], relaxed: &mut HashSet<String>) -> usize {
    let mut count = 0;
    for outcome in failing {
        if outcome.priority != CriteriaPriority::Critical && relaxed.insert(outcome.id.clone()) {
            count += 1;
        }
    }
    count
}

fn improvement_prompt(
    content: &str,
    strategy: ImproveStrategy,
    targets: &[CriteriaOutcome],
) -> String {
    let flavor = match strategy {
        ImproveStrategy::FocusCritical => {
            "Fix only the critical problems listed below; change nothing else."
        }
        ImproveStrategy::BatchImprovements => {
            "Address every problem listed below in one coherent revision."
        }
        ImproveStrategy::AggressiveRefactor => {
            "These problems keep recurring. Restructure the content as deeply as needed to resolve them for good."
        }
        ImproveStrategy::Incremental => "Make one focused improvement for the problem below.",
    };

    let mut problems = String::new();
    for outcome in targets {
        problems.push_str(&format!("- {}: {}\n", outcome.name, outcome.result.details));
        for suggestion in &outcome.result.suggestions {
            problems.push_str(&format!("  suggestion: {suggestion}\n"));
        }
    }

    format!("{flavor}\n\nProblems:\n{problems}\nContent:\n{content}\n\nReturn only the revised content.")
}
