//! Content-transformation strategies for unmet goals.
//!
//! The manager picks the registered strategy with the best effectiveness
//! estimate among those that can handle the current goal set. Built-ins:
//! expansion (small word gaps), addition (large gaps), regeneration (last
//! resort), and quality enhancement.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::agent::Agent;
use crate::errors::PipelineError;
use crate::goals::{Goal, GoalKind};
use crate::phase::PhaseInput;
use crate::session::RunContext;

/// A content transformation aimed at closing goal gaps.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    fn can_handle(&self, goals: &[Goal]) -> bool;

    /// Expected effectiveness for these goals, in [0, 1].
    fn estimate_effectiveness(&self, goals: &[Goal]) -> f64;

    /// Transform the input to better satisfy the goals.
    async fn execute(
        &self,
        ctx: &RunContext,
        input: PhaseInput,
        goals: &[Goal],
    ) -> Result<PhaseInput, PipelineError>;
}

/// Registry that selects the best-fitting strategy per goal set.
#[derive(Default)]
pub struct StrategyManager {
    strategies: RwLock<Vec<Arc<dyn Strategy>>>,
}

impl StrategyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// A manager pre-loaded with the built-in strategies.
    pub fn with_builtins(agent: Arc<dyn Agent>) -> Self {
        let manager = Self::new();
        manager.register(Arc::new(ExpansionStrategy::new(Arc::clone(&agent))));
        manager.register(Arc::new(AdditionStrategy::new(Arc::clone(&agent))));
        manager.register(Arc::new(QualityEnhancementStrategy::new(Arc::clone(&agent))));
        manager.register(Arc::new(RegenerationStrategy::new(agent)));
        manager
    }

    pub fn register(&self, strategy: Arc<dyn Strategy>) {
        self.strategies.write().expect("strategy lock").push(strategy);
    }

    /// The handler with maximum estimated effectiveness among those whose
    /// `can_handle` accepts the goals. Ties break arbitrarily.
    pub fn select_optimal(&self, goals: &[Goal]) -> Option<Arc<dyn Strategy>> {
        let strategies = self.strategies.read().expect("strategy lock");
        let best = strategies
            .iter()
            .filter(|s| s.can_handle(goals))
            .max_by(|a, b| {
                a.estimate_effectiveness(goals)
                    .total_cmp(&b.estimate_effectiveness(goals))
            })
            .cloned();
        if let Some(ref strategy) = best {
            debug!(strategy = strategy.name(), "selected strategy");
        }
        best
    }
}

fn word_gap(goals: &[Goal]) -> Option<f64> {
    goals
        .iter()
        .find(|g| g.kind == GoalKind::WordCount && !g.met)
        .map(Goal::gap)
}

fn has_unmet_quality(goals: &[Goal]) -> bool {
    goals
        .iter()
        .any(|g| g.kind == GoalKind::QualityScore && !g.met)
}

/// Expand existing scenes with more detail. Best for small word gaps.
pub struct ExpansionStrategy {
    agent: Arc<dyn Agent>,
}

impl ExpansionStrategy {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl Strategy for ExpansionStrategy {
    fn name(&self) -> &str {
        "expansion"
    }

    fn can_handle(&self, goals: &[Goal]) -> bool {
        word_gap(goals).is_some_and(|gap| gap > 0.0)
    }

    fn estimate_effectiveness(&self, goals: &[Goal]) -> f64 {
        match word_gap(goals) {
            Some(gap) if gap > 0.0 => (1.0 - gap / 5000.0).clamp(0.2, 0.95),
            _ => 0.0,
        }
    }

    async fn execute(
        &self,
        ctx: &RunContext,
        input: PhaseInput,
        goals: &[Goal],
    ) -> Result<PhaseInput, PipelineError> {
        let gap = word_gap(goals).unwrap_or(0.0) as usize;
        info!(gap, "expanding existing content");
        let prompt = format!(
            "Expand the following content with richer detail, description, and \
             dialogue. Add roughly {gap} words without changing the structure \
             or plot. Return only the expanded content.\n\n{}",
            input.data_as_text()
        );
        let expanded = self.agent.execute(ctx, &prompt, None).await?;
        Ok(input.with_data(Value::String(expanded)))
    }
}

/// Add new scenes to existing chapters. Best for mid-size gaps.
pub struct AdditionStrategy {
    agent: Arc<dyn Agent>,
}

impl AdditionStrategy {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl Strategy for AdditionStrategy {
    fn name(&self) -> &str {
        "addition"
    }

    fn can_handle(&self, goals: &[Goal]) -> bool {
        word_gap(goals).is_some_and(|gap| gap > 0.0)
    }

    fn estimate_effectiveness(&self, goals: &[Goal]) -> f64 {
        match word_gap(goals) {
            Some(gap) if gap > 0.0 => (gap / 5000.0).clamp(0.1, 0.95),
            _ => 0.0,
        }
    }

    async fn execute(
        &self,
        ctx: &RunContext,
        input: PhaseInput,
        goals: &[Goal],
    ) -> Result<PhaseInput, PipelineError> {
        let gap = word_gap(goals).unwrap_or(0.0) as usize;
        info!(gap, "adding new content sections");
        let prompt = format!(
            "The following content is about {gap} words short. Add new scenes \
             or sections that fit the existing structure and advance it. \
             Return the full content including the additions.\n\n{}",
            input.data_as_text()
        );
        let extended = self.agent.execute(ctx, &prompt, None).await?;
        Ok(input.with_data(Value::String(extended)))
    }
}

/// Regenerate content wholesale. Low effectiveness by design: the last
/// resort when nothing targeted applies.
pub struct RegenerationStrategy {
    agent: Arc<dyn Agent>,
}

impl RegenerationStrategy {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl Strategy for RegenerationStrategy {
    fn name(&self) -> &str {
        "regeneration"
    }

    fn can_handle(&self, goals: &[Goal]) -> bool {
        goals.iter().any(|g| !g.met)
    }

    fn estimate_effectiveness(&self, _goals: &[Goal]) -> f64 {
        0.15
    }

    async fn execute(
        &self,
        ctx: &RunContext,
        input: PhaseInput,
        goals: &[Goal],
    ) -> Result<PhaseInput, PipelineError> {
        let targets: Vec<String> = goals
            .iter()
            .filter(|g| !g.met)
            .map(|g| format!("{}: {} (currently {})", g.kind, g.target, g.current))
            .collect();
        info!(targets = targets.len(), "regenerating content");
        let prompt = format!(
            "Rewrite the following content from scratch for this request: {}\n\
             Unmet targets:\n{}\n\nContent:\n{}",
            input.request,
            targets.join("\n"),
            input.data_as_text()
        );
        let regenerated = self.agent.execute(ctx, &prompt, None).await?;
        Ok(input.with_data(Value::String(regenerated)))
    }
}

/// Polish prose quality without changing length or structure.
pub struct QualityEnhancementStrategy {
    agent: Arc<dyn Agent>,
}

impl QualityEnhancementStrategy {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl Strategy for QualityEnhancementStrategy {
    fn name(&self) -> &str {
        "quality_enhancement"
    }

    fn can_handle(&self, goals: &[Goal]) -> bool {
        has_unmet_quality(goals)
    }

    fn estimate_effectiveness(&self, goals: &[Goal]) -> f64 {
        if has_unmet_quality(goals) { 0.8 } else { 0.0 }
    }

    async fn execute(
        &self,
        ctx: &RunContext,
        input: PhaseInput,
        _goals: &[Goal],
    ) -> Result<PhaseInput, PipelineError> {
        info!("enhancing content quality");
        let prompt = format!(
            "Improve the prose quality of the following content: tighten \
             sentences, strengthen word choice, fix pacing. Keep length and \
             structure. Return only the improved content.\n\n{}",
            input.data_as_text()
        );
        let enhanced = self.agent.execute(ctx, &prompt, None).await?;
        Ok(input.with_data(Value::String(enhanced)))
    }
}
