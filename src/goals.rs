//! Typed, prioritized goals with progress tracking and strategy suggestion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Closed set of measurable goal types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalKind {
    WordCount,
    QualityScore,
    Completeness,
    SceneCount,
    ChapterCount,
}

impl GoalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WordCount => "word_count",
            Self::QualityScore => "quality_score",
            Self::Completeness => "completeness",
            Self::SceneCount => "scene_count",
            Self::ChapterCount => "chapter_count",
        }
    }
}

impl std::fmt::Display for GoalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Acceptance check for a goal's current value.
pub type GoalValidator = Arc<dyn Fn(f64) -> bool + Send + Sync>;

/// A measurable, prioritized target.
#[derive(Clone)]
pub struct Goal {
    pub kind: GoalKind,
    pub target: f64,
    pub current: f64,
    /// 1 (lowest) to 10 (highest).
    pub priority: u8,
    pub met: bool,
    /// Suggested strategy name for closing the gap, set on update.
    pub strategy: Option<String>,
    pub validator: Option<GoalValidator>,
    pub last_updated: DateTime<Utc>,
}

impl Goal {
    pub fn new(kind: GoalKind, target: f64, priority: u8) -> Self {
        let mut goal = Self {
            kind,
            target,
            current: 0.0,
            priority: priority.clamp(1, 10),
            met: false,
            strategy: None,
            validator: None,
            last_updated: Utc::now(),
        };
        goal.met = goal.evaluate();
        goal
    }

    pub fn with_validator(mut self, validator: GoalValidator) -> Self {
        self.validator = Some(validator);
        self.met = self.evaluate();
        self
    }

    /// Progress toward the target as a percentage, capped at 100.
    pub fn progress(&self) -> f64 {
        if self.target <= 0.0 {
            return 100.0;
        }
        (self.current / self.target * 100.0).min(100.0)
    }

    /// Numeric deficit; zero once the target is reached.
    pub fn gap(&self) -> f64 {
        (self.target - self.current).max(0.0)
    }

    fn evaluate(&self) -> bool {
        match &self.validator {
            Some(validator) => validator(self.current),
            // Zero targets are trivially met.
            None => self.current >= self.target,
        }
    }
}

impl std::fmt::Debug for Goal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Goal")
            .field("kind", &self.kind)
            .field("target", &self.target)
            .field("current", &self.current)
            .field("priority", &self.priority)
            .field("met", &self.met)
            .field("strategy", &self.strategy)
            .finish()
    }
}

/// Serializable snapshot of one goal, for reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalSummary {
    pub kind: GoalKind,
    pub target: f64,
    pub current: f64,
    pub priority: u8,
    pub met: bool,
    pub progress_pct: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

impl From<&Goal> for GoalSummary {
    fn from(goal: &Goal) -> Self {
        Self {
            kind: goal.kind,
            target: goal.target,
            current: goal.current,
            priority: goal.priority,
            met: goal.met,
            progress_pct: goal.progress(),
            strategy: goal.strategy.clone(),
        }
    }
}

/// Tracks the goals of one run behind a reader-preferring lock.
#[derive(Default)]
pub struct GoalTracker {
    goals: RwLock<HashMap<GoalKind, Goal>>,
}

impl GoalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_goal(&self, goal: Goal) {
        self.goals.write().expect("goal lock").insert(goal.kind, goal);
    }

    /// Drop all goals. The orchestrator calls this at the start of a run so
    /// a reused instance does not carry the previous request's targets.
    pub fn clear(&self) {
        self.goals.write().expect("goal lock").clear();
    }

    /// Word-count goal accepting 90% of the target as satisfied.
    pub fn set_word_count_goal(&self, target: usize, priority: u8) {
        let threshold = target as f64 * 0.9;
        self.add_goal(
            Goal::new(GoalKind::WordCount, target as f64, priority)
                .with_validator(Arc::new(move |current| current >= threshold)),
        );
    }

    pub fn set_quality_goal(&self, target: f64, priority: u8) {
        self.add_goal(Goal::new(GoalKind::QualityScore, target, priority));
    }

    /// Update a goal's current value, re-evaluating `met` and refreshing
    /// the suggested strategy.
    pub fn update(&self, kind: GoalKind, current: f64) {
        let mut goals = self.goals.write().expect("goal lock");
        let Some(goal) = goals.get_mut(&kind) else {
            return;
        };
        goal.current = current;
        goal.met = goal.evaluate();
        goal.last_updated = Utc::now();
        goal.strategy = suggest_strategy(goal);
        debug!(
            kind = %goal.kind,
            current = goal.current,
            target = goal.target,
            met = goal.met,
            "goal updated"
        );
    }

    pub fn get(&self, kind: GoalKind) -> Option<Goal> {
        self.goals.read().expect("goal lock").get(&kind).cloned()
    }

    /// Unmet goals, highest priority first.
    pub fn get_unmet(&self) -> Vec<Goal> {
        let mut unmet: Vec<Goal> = self
            .goals
            .read()
            .expect("goal lock")
            .values()
            .filter(|g| !g.met)
            .cloned()
            .collect();
        unmet.sort_by(|a, b| b.priority.cmp(&a.priority));
        unmet
    }

    pub fn all_met(&self) -> bool {
        self.goals.read().expect("goal lock").values().all(|g| g.met)
    }

    pub fn met_count(&self) -> usize {
        self.goals
            .read()
            .expect("goal lock")
            .values()
            .filter(|g| g.met)
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.goals.read().expect("goal lock").len()
    }

    /// Mean progress across all goals, in percent. 100 when no goals exist.
    pub fn average_progress(&self) -> f64 {
        let goals = self.goals.read().expect("goal lock");
        if goals.is_empty() {
            return 100.0;
        }
        goals.values().map(Goal::progress).sum::<f64>() / goals.len() as f64
    }

    pub fn progress_summary(&self) -> Vec<GoalSummary> {
        let mut summaries: Vec<GoalSummary> = self
            .goals
            .read()
            .expect("goal lock")
            .values()
            .map(GoalSummary::from)
            .collect();
        summaries.sort_by(|a, b| b.priority.cmp(&a.priority));
        summaries
    }
}

/// Strategy for closing a goal's gap.
///
/// Word-count gaps escalate from expanding existing scenes, to adding
/// scenes, to adding whole chapters. Quality lagging below 80% progress
/// gets the enhancement pass.
fn suggest_strategy(goal: &Goal) -> Option<String> {
    match goal.kind {
        GoalKind::WordCount => {
            let gap = goal.gap();
            if gap <= 0.0 {
                None
            } else if gap < 1000.0 {
                Some("expand_scenes".to_string())
            } else if gap < 5000.0 {
                Some("add_scenes".to_string())
            } else {
                Some("add_chapters".to_string())
            }
        }
        GoalKind::QualityScore => {
            if goal.progress() < 80.0 {
                Some("enhance_quality".to_string())
            } else {
                None
            }
        }
        _ => None,
    }
}
