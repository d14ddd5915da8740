//! The unified orchestrator: goal-aware, adaptive, quality-driven.
//!
//! For each request it analyzes measurable goals, picks a phase sequence
//! (learned or registered order), executes phases with mid-run sequence
//! mutation (recovery and expansion phases inserted as needed), updates goal
//! progress after every phase, and finishes with a strategy pass, an
//! optional improvement run, and a bounded unified iteration when goals or
//! quality fall short.

mod analysis;
mod report;

pub use analysis::RequestProfile;
pub use report::{PhaseRecord, RunReport};

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::adaptive::{AdaptiveError, AdaptiveErrorHandler};
use crate::agent::Agent;
use crate::cache::ResultCache;
use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::config::{CacheConfig, ImprovementConfig, OrchestratorConfig};
use crate::engine::ExecutionEngine;
use crate::errors::{PhaseError, PipelineError};
use crate::goals::{GoalKind, GoalTracker};
use crate::improve::{ImprovementEngine, Inspector};
use crate::phase::{Phase, PhaseInput, PhaseRegistry};
use crate::resilience::ResilienceManager;
use crate::session::{RunContext, SessionId};
use crate::storage::Storage;
use crate::strategy::StrategyManager;
use crate::util::{chapter_count, scene_count, word_count};
use crate::verify::StageVerifier;

/// Recovery phase inserted after timeouts.
pub const QUICK_GENERATION: &str = "QuickGeneration";
/// Recovery phase inserted after quality failures.
pub const QUALITY_REFINEMENT: &str = "QualityRefinement";
/// Recovery phase inserted after incompleteness failures.
pub const GOAL_COMPLETION: &str = "GoalCompletion";
/// Expansion phase for lagging word-count goals.
pub const CONTENT_EXPANSION: &str = "ContentExpansion";
/// Expansion phase for lagging chapter-count goals.
pub const CHAPTER_GENERATION: &str = "ChapterGeneration";

/// Synthetic record name for the final unified iteration.
const UNIFIED_ITERATION: &str = "UnifiedIteration";

/// Top-level orchestrator owning the execution substrates.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: PhaseRegistry,
    agent: Arc<dyn Agent>,
    storage: Arc<dyn Storage>,
    engine: ExecutionEngine,
    goals: GoalTracker,
    checkpoints: Option<Arc<CheckpointManager>>,
    verifier: Arc<StageVerifier>,
    adaptive: AdaptiveErrorHandler,
    resilience: ResilienceManager,
    improvement: ImprovementEngine,
    strategies: StrategyManager,
    /// Learned phase sequences keyed by request type.
    sequences: RwLock<HashMap<String, Vec<String>>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        agent: Arc<dyn Agent>,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let checkpoints = config
            .checkpointing_enabled
            .then(|| Arc::new(CheckpointManager::new(Arc::clone(&storage))));
        let verifier = Arc::new(
            StageVerifier::new(Arc::clone(&storage))
                .with_retry_limit(config.max_retries)
                .with_backoff_unit(config.base_delay),
        );

        let mut engine = ExecutionEngine::new(&config).with_verifier(Arc::clone(&verifier));
        if config.performance_enabled {
            engine = engine.with_cache(Arc::new(ResultCache::new(CacheConfig::default())));
        }
        if let Some(checkpoints) = &checkpoints {
            engine = engine.with_checkpoints(Arc::clone(checkpoints));
        }

        let improvement = ImprovementEngine::new(ImprovementConfig::default(), Arc::clone(&agent))
            .with_storage(Arc::clone(&storage));
        let strategies = StrategyManager::with_builtins(Arc::clone(&agent));

        Self {
            config,
            registry: PhaseRegistry::new(),
            agent,
            storage,
            engine,
            goals: GoalTracker::new(),
            checkpoints,
            verifier,
            adaptive: AdaptiveErrorHandler::new(),
            resilience: ResilienceManager::default(),
            improvement,
            strategies,
            sequences: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_phase(&mut self, phase: Arc<dyn Phase>) {
        self.registry.register(phase);
    }

    /// Register a phase only for mid-run insertion (recovery, expansion);
    /// it does not join the default sequence.
    pub fn register_recovery_phase(&mut self, phase: Arc<dyn Phase>) {
        self.registry.register_auxiliary(phase);
    }

    pub fn register_inspector(&mut self, inspector: Arc<dyn Inspector>) {
        self.improvement.register_inspector(inspector);
    }

    pub fn goals(&self) -> &GoalTracker {
        &self.goals
    }

    pub fn adaptive(&self) -> &AdaptiveErrorHandler {
        &self.adaptive
    }

    pub fn resilience(&self) -> &ResilienceManager {
        &self.resilience
    }

    pub fn strategies(&self) -> &StrategyManager {
        &self.strategies
    }

    pub fn checkpoints(&self) -> Option<&Arc<CheckpointManager>> {
        self.checkpoints.as_ref()
    }

    /// The stage verifier every phase runs through. Register per-stage
    /// verifiers here before calling [`Orchestrator::run`].
    pub fn verifier(&self) -> &Arc<StageVerifier> {
        &self.verifier
    }

    /// Orchestrate a fresh session for a request.
    pub async fn run(&self, ctx: &RunContext, request: &str) -> Result<RunReport, PhaseError> {
        let session_id = SessionId::generate();
        self.run_session(ctx, request, session_id, 0).await
    }

    /// Resume an interrupted session from `start_phase`.
    pub async fn resume(
        &self,
        ctx: &RunContext,
        request: &str,
        session_id: SessionId,
        start_phase: usize,
    ) -> Result<RunReport, PhaseError> {
        if let Some(manager) = &self.checkpoints
            && let Err(e) = manager.mark_as_resumed(ctx, &session_id).await
        {
            warn!(session = %session_id, error = %e, "could not mark session resumed");
        }
        self.run_session(ctx, request, session_id, start_phase).await
    }

    async fn run_session(
        &self,
        ctx: &RunContext,
        request: &str,
        session_id: SessionId,
        start_phase: usize,
    ) -> Result<RunReport, PhaseError> {
        let run_started = Instant::now();
        let profile = RequestProfile::analyze(request);
        self.apply_goals(&profile);

        let mut sequence = self.initial_sequence(ctx, &profile).await;
        // Request types with a failure history get a stricter quality bar,
        // inserting refinement earlier.
        let adaptation_needed = self
            .adaptive
            .error_count_for_request_type(&profile.request_type)
            > 2;
        let refinement_threshold = if adaptation_needed { 0.8 } else { 0.7 };
        info!(
            session = %session_id,
            request_type = %profile.request_type,
            phases = sequence.len(),
            word_target = ?profile.word_target,
            quality_required = profile.quality_required,
            adaptation_needed,
            "starting orchestrated run"
        );

        let mut records: Vec<PhaseRecord> = Vec::new();
        let mut inserted: HashSet<String> = HashSet::new();
        let mut previous_data = Value::Null;

        if start_phase > 0
            && let Some(manager) = &self.checkpoints
            && let Ok(Some(checkpoint)) = manager.load(ctx, &session_id).await
        {
            previous_data = checkpoint.last_output();
        }

        let mut index = start_phase;
        while index < sequence.len() {
            let phase = Arc::clone(&sequence[index]);
            if let Err(e) = ctx.check() {
                return Err(PhaseError::new(phase.name(), 0, e));
            }

            let input =
                PhaseInput::new(request, session_id.clone()).with_data(previous_data.clone());
            match self.engine.execute_phase(ctx, &phase, input).await {
                Ok(execution) => {
                    previous_data = execution.output.data.clone();
                    if let Some(manager) = &self.checkpoints {
                        let checkpoint = Checkpoint::new(
                            session_id.clone(),
                            index + 1,
                            phase.name(),
                            request,
                            previous_data.clone(),
                        );
                        manager
                            .save(ctx, checkpoint)
                            .await
                            .map_err(|e| PhaseError::new(phase.name(), execution.attempts, e))?;
                    }

                    let quality = quality_score(
                        execution.attempts,
                        execution.duration,
                        phase.estimated_duration(),
                    );
                    records.push(PhaseRecord {
                        name: phase.name().to_string(),
                        attempts: execution.attempts,
                        duration_ms: execution.duration.as_millis() as u64,
                        quality,
                        inserted: inserted.contains(phase.name()),
                    });
                    self.update_goal_progress(&previous_data, &records);

                    // Lagging individual goals past the halfway point get a
                    // goal-specific expansion phase.
                    if index + 1 > sequence.len() / 2 {
                        for goal in self.goals.get_unmet() {
                            if goal.progress() < 30.0 {
                                let name = match goal.kind {
                                    GoalKind::WordCount => CONTENT_EXPANSION,
                                    GoalKind::ChapterCount => CHAPTER_GENERATION,
                                    _ => continue,
                                };
                                self.insert_phase(&mut sequence, &mut inserted, index, name);
                            }
                        }
                    }

                    if profile.quality_required && quality < refinement_threshold {
                        self.insert_phase(&mut sequence, &mut inserted, index, QUALITY_REFINEMENT);
                    }

                    // At the end of the sequence, append expansion phases for
                    // whatever is still behind.
                    if index + 1 == sequence.len() && self.goals.average_progress() < 90.0 {
                        for goal in self.goals.get_unmet() {
                            let name = match goal.kind {
                                GoalKind::WordCount => CONTENT_EXPANSION,
                                GoalKind::ChapterCount => CHAPTER_GENERATION,
                                GoalKind::QualityScore => QUALITY_REFINEMENT,
                                _ => continue,
                            };
                            self.insert_phase(&mut sequence, &mut inserted, index, name);
                        }
                    }
                }
                Err(err) => {
                    let mut context = HashMap::new();
                    context.insert("request_type".to_string(), profile.request_type.clone());
                    context.insert("phase".to_string(), phase.name().to_string());
                    let adaptive_err = self.adaptive.handle(&err.source, context);

                    if let Some(recovery) = recovery_phase_name(&adaptive_err, &err)
                        && self.insert_phase(&mut sequence, &mut inserted, index, recovery)
                    {
                        warn!(
                            phase = phase.name(),
                            recovery, "phase failed, inserted recovery phase"
                        );
                        index += 1;
                        continue;
                    }

                    match self
                        .adaptive
                        .recover_with_learning(ctx, &adaptive_err, previous_data.clone())
                        .await
                    {
                        Ok(data) => {
                            info!(phase = phase.name(), "recovered transparently");
                            previous_data = data;
                            records.push(PhaseRecord {
                                name: phase.name().to_string(),
                                attempts: err.attempt,
                                duration_ms: 0,
                                quality: 0.5,
                                inserted: inserted.contains(phase.name()),
                            });
                        }
                        Err(_) => {
                            warn!(phase = phase.name(), error = %err, "run failed");
                            return Err(err);
                        }
                    }
                }
            }
            index += 1;
        }

        // Unmet goals get one targeted content-strategy pass.
        let unmet = self.goals.get_unmet();
        if !unmet.is_empty()
            && let Some(strategy) = self.strategies.select_optimal(&unmet)
        {
            debug!(strategy = strategy.name(), "applying goal strategy");
            let input =
                PhaseInput::new(request, session_id.clone()).with_data(previous_data.clone());
            match strategy.execute(ctx, input, &unmet).await {
                Ok(transformed) => {
                    previous_data = transformed.data;
                    self.update_goal_progress(&previous_data, &records);
                }
                Err(e) => warn!(strategy = strategy.name(), error = %e, "strategy failed"),
            }
        }

        // Quality-driven improvement when inspectors are registered.
        if profile.quality_required && self.improvement.inspector_count() > 0 {
            let content = data_as_text(&previous_data);
            match self
                .improvement
                .improve(ctx, &content, self.config.target_quality)
                .await
            {
                Ok(session) => {
                    previous_data = Value::String(session.final_content);
                    self.update_goal_progress(&previous_data, &records);
                    // Inspector score supersedes the heuristic phase score.
                    self.goals.update(GoalKind::QualityScore, session.final_quality);
                }
                Err(e) => warn!(error = %e, "improvement run failed"),
            }
        }

        let mut overall_quality = mean_quality(&records);
        if !self.goals.all_met() || overall_quality < self.config.target_quality {
            let iteration_started = Instant::now();
            match self.unified_iteration(ctx, request, &previous_data).await {
                Ok(improved) => {
                    previous_data = improved;
                    self.update_goal_progress(&previous_data, &records);
                    records.push(PhaseRecord {
                        name: UNIFIED_ITERATION.to_string(),
                        attempts: 1,
                        duration_ms: iteration_started.elapsed().as_millis() as u64,
                        quality: quality_score(
                            1,
                            iteration_started.elapsed(),
                            self.config.final_iteration_timeout,
                        ),
                        inserted: true,
                    });
                    overall_quality = mean_quality(&records);
                }
                Err(e) => warn!(error = %e, "unified iteration failed"),
            }
        }

        let success = self.goals.all_met();
        let final_text = data_as_text(&previous_data);
        if !final_text.is_empty() {
            let artifact_path = format!("artifacts/{session_id}.md");
            if let Err(e) = self
                .storage
                .save(ctx, &artifact_path, final_text.as_bytes())
                .await
            {
                warn!(error = %e, "could not persist final artifact");
            }
        }

        if success {
            let executed: Vec<String> = records.iter().map(|r| r.name.clone()).collect();
            self.record_sequence(ctx, &profile.request_type, executed).await;
        }

        let report = RunReport {
            session_id: session_id.clone(),
            request: request.to_string(),
            request_type: profile.request_type.clone(),
            success,
            phases: records,
            goals: self.goals.progress_summary(),
            overall_quality,
            final_word_count: word_count(&final_text),
            duration_ms: run_started.elapsed().as_millis() as u64,
            timestamp: chrono::Utc::now(),
        };

        if let Ok(bytes) = serde_json::to_vec_pretty(&report) {
            if let Err(e) = self.storage.save(ctx, &report.report_path(), &bytes).await {
                warn!(error = %e, "could not persist run report");
            }
        }

        info!(
            session = %session_id,
            success,
            quality = overall_quality,
            phases = report.phases.len(),
            elapsed_ms = report.duration_ms,
            "run finished"
        );
        Ok(report)
    }

    fn apply_goals(&self, profile: &RequestProfile) {
        self.goals.clear();
        if let Some(words) = profile.word_target {
            self.goals.set_word_count_goal(words, 8);
        }
        if let Some(chapters) = profile.chapter_target {
            self.goals.add_goal(crate::goals::Goal::new(
                GoalKind::ChapterCount,
                chapters as f64,
                7,
            ));
        }
        if profile.quality_required {
            self.goals.set_quality_goal(self.config.target_quality, 7);
        }
    }

    /// Learned sequence for the request type when one exists, otherwise the
    /// registered phase order.
    async fn initial_sequence(
        &self,
        ctx: &RunContext,
        profile: &RequestProfile,
    ) -> Vec<Arc<dyn Phase>> {
        let learned = {
            let sequences = self.sequences.read().expect("sequence lock");
            sequences.get(&profile.request_type).cloned()
        };

        let names = match learned {
            Some(names) => Some(names),
            None => self.load_sequence(ctx, &profile.request_type).await,
        };

        if let Some(names) = names {
            let phases: Vec<Arc<dyn Phase>> = names
                .iter()
                .filter_map(|name| self.registry.get(name))
                .collect();
            if !phases.is_empty() {
                debug!(request_type = %profile.request_type, "using learned sequence");
                return phases;
            }
        }
        self.registry.ordered()
    }

    async fn load_sequence(&self, ctx: &RunContext, request_type: &str) -> Option<Vec<String>> {
        let path = format!("patterns/{request_type}.json");
        if !self.storage.exists(ctx, &path).await {
            return None;
        }
        let bytes = self.storage.load(ctx, &path).await.ok()?;
        let value: Value = serde_json::from_slice(&bytes).ok()?;
        let names = value.get("phases")?.as_array()?;
        Some(
            names
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
        )
    }

    async fn record_sequence(&self, ctx: &RunContext, request_type: &str, mut names: Vec<String>) {
        names.retain(|name| self.registry.get(name).is_some());
        if names.is_empty() {
            return;
        }
        self.sequences
            .write()
            .expect("sequence lock")
            .insert(request_type.to_string(), names.clone());

        let record = serde_json::json!({
            "request_type": request_type,
            "phases": names,
            "recorded_at": chrono::Utc::now(),
        });
        let path = format!("patterns/{request_type}.json");
        if let Ok(bytes) = serde_json::to_vec_pretty(&record)
            && let Err(e) = self.storage.save(ctx, &path, &bytes).await
        {
            warn!(error = %e, "could not persist learned sequence");
        }
    }

    /// Insert a registered phase right after `index`, at most once per run.
    fn insert_phase(
        &self,
        sequence: &mut Vec<Arc<dyn Phase>>,
        inserted: &mut HashSet<String>,
        index: usize,
        name: &str,
    ) -> bool {
        if inserted.contains(name) {
            return false;
        }
        let Some(phase) = self.registry.get(name) else {
            return false;
        };
        sequence.insert(index + 1, phase);
        inserted.insert(name.to_string());
        info!(phase = name, position = index + 1, "inserted phase mid-run");
        true
    }

    fn update_goal_progress(&self, data: &Value, records: &[PhaseRecord]) {
        let text = data_as_text(data);
        self.goals
            .update(GoalKind::WordCount, word_count(&text) as f64);
        self.goals
            .update(GoalKind::ChapterCount, chapter_count(&text) as f64);
        self.goals
            .update(GoalKind::SceneCount, scene_count(&text) as f64);
        if !records.is_empty() {
            self.goals
                .update(GoalKind::QualityScore, mean_quality(records));
        }
    }

    /// One synthesized improvement pass against both goals and quality,
    /// bounded by a hard timeout.
    async fn unified_iteration(
        &self,
        ctx: &RunContext,
        request: &str,
        data: &Value,
    ) -> Result<Value, PipelineError> {
        let goal_lines: Vec<String> = self
            .goals
            .progress_summary()
            .iter()
            .filter(|g| !g.met)
            .map(|g| format!("- {}: {:.0} of {:.0}", g.kind, g.current, g.target))
            .collect();

        let prompt = format!(
            "You are finalizing a long-form deliverable.\n\nOriginal request: {request}\n\n\
             Current content:\n{content}\n\nUnmet targets:\n{goals}\n\n\
             Revise the content so every target is satisfied while improving \
             overall quality. Return only the revised content.",
            content = data_as_text(data),
            goals = goal_lines.join("\n"),
        );

        info!(unmet = goal_lines.len(), "running unified iteration");
        let improved = ctx
            .run_with_timeout(
                self.config.final_iteration_timeout,
                self.resilience.execute_with_retry(ctx, "unified-iteration", |_| {
                    self.agent.execute(ctx, &prompt, None)
                }),
            )
            .await??;
        Ok(Value::String(improved))
    }
}

fn data_as_text(data: &Value) -> String {
    match data {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn mean_quality(records: &[PhaseRecord]) -> f64 {
    if records.is_empty() {
        return 1.0;
    }
    records.iter().map(|r| r.quality).sum::<f64>() / records.len() as f64
}

/// Heuristic per-phase quality: retries and overruns cost, cache hits are
/// free. Clamped to [0, 1].
fn quality_score(attempts: u32, duration: Duration, estimate: Duration) -> f64 {
    if attempts == 0 {
        return 1.0;
    }
    let retry_penalty = 0.15 * (attempts.saturating_sub(1)) as f64;
    let overrun = if estimate > Duration::ZERO {
        (duration.as_secs_f64() / estimate.as_secs_f64() - 1.0).max(0.0)
    } else {
        0.0
    };
    (1.0 - retry_penalty - 0.2 * overrun.min(1.0)).clamp(0.0, 1.0)
}

/// Which registered recovery phase fits this failure, if any.
fn recovery_phase_name(adaptive_err: &AdaptiveError, err: &PhaseError) -> Option<&'static str> {
    match &err.source {
        PipelineError::Timeout { .. } => Some(QUICK_GENERATION),
        PipelineError::InvalidOutput(_) | PipelineError::VerificationFailed { .. } => {
            Some(QUALITY_REFINEMENT)
        }
        _ if adaptive_err.message.contains("incomplete") => Some(GOAL_COMPLETION),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::PhaseOutput;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn repeated_words(count: usize) -> String {
        "lorem ".repeat(count).trim_end().to_string()
    }

    /// Agent returning a fixed response regardless of prompt.
    struct FixedAgent {
        response: String,
    }

    #[async_trait]
    impl Agent for FixedAgent {
        async fn execute(
            &self,
            _ctx: &RunContext,
            _prompt: &str,
            _input: Option<&Value>,
        ) -> Result<String, PipelineError> {
            Ok(self.response.clone())
        }
    }

    /// Phase emitting a fixed number of words.
    struct WordsPhase {
        name: String,
        words: usize,
        calls: AtomicU32,
    }

    impl WordsPhase {
        fn new(name: &str, words: usize) -> Self {
            Self {
                name: name.to_string(),
                words,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Phase for WordsPhase {
        fn name(&self) -> &str {
            &self.name
        }

        fn estimated_duration(&self) -> Duration {
            Duration::from_secs(5)
        }

        async fn execute(
            &self,
            _ctx: &RunContext,
            input: PhaseInput,
        ) -> Result<PhaseOutput, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(PhaseOutput::new(
                &input,
                Value::String(repeated_words(self.words)),
            ))
        }
    }

    /// Phase that doubles whatever words it receives.
    struct DoublerPhase;

    #[async_trait]
    impl Phase for DoublerPhase {
        fn name(&self) -> &str {
            CONTENT_EXPANSION
        }

        fn estimated_duration(&self) -> Duration {
            Duration::from_secs(5)
        }

        async fn execute(
            &self,
            _ctx: &RunContext,
            input: PhaseInput,
        ) -> Result<PhaseOutput, PipelineError> {
            let text = input.data_as_text();
            Ok(PhaseOutput::new(
                &input,
                Value::String(format!("{text} {text}")),
            ))
        }
    }

    /// Phase that always times out.
    struct StallingPhase;

    #[async_trait]
    impl Phase for StallingPhase {
        fn name(&self) -> &str {
            "Stalling"
        }

        fn estimated_duration(&self) -> Duration {
            Duration::from_millis(5)
        }

        async fn execute(
            &self,
            _ctx: &RunContext,
            input: PhaseInput,
        ) -> Result<PhaseOutput, PipelineError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(PhaseOutput::new(&input, Value::Null))
        }
    }

    fn fast_config() -> OrchestratorConfig {
        OrchestratorConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            final_iteration_timeout: Duration::from_secs(5),
            ..OrchestratorConfig::default()
        }
    }

    fn orchestrator_with(
        agent: Arc<dyn Agent>,
        storage: Arc<MemoryStorage>,
    ) -> Orchestrator {
        Orchestrator::new(fast_config(), agent, storage as Arc<dyn Storage>)
    }

    #[tokio::test]
    async fn plain_run_with_no_phases_succeeds_empty() {
        let ctx = RunContext::new();
        let storage = Arc::new(MemoryStorage::new());
        let orchestrator = orchestrator_with(
            Arc::new(FixedAgent {
                response: String::new(),
            }),
            storage,
        );

        let report = orchestrator.run(&ctx, "summarize this").await.unwrap();
        assert!(report.success);
        assert!(report.phases.is_empty());
        assert_eq!(report.final_word_count, 0);
    }

    #[tokio::test]
    async fn goal_aware_expansion_reaches_word_target() {
        let ctx = RunContext::new();
        let storage = Arc::new(MemoryStorage::new());
        let mut orchestrator = orchestrator_with(
            Arc::new(FixedAgent {
                response: String::new(),
            }),
            Arc::clone(&storage),
        );
        orchestrator.register_phase(Arc::new(WordsPhase::new("Drafting", 9_000)));
        orchestrator.register_recovery_phase(Arc::new(DoublerPhase));

        let report = orchestrator
            .run(&ctx, "Write a 20,000 word story")
            .await
            .unwrap();

        assert!(report.success, "goals: {:?}", report.goals);
        // 9000 words doubled lands at 18000, the 90% acceptance threshold.
        assert!(report.final_word_count >= 18_000);
        let word_goal = report
            .goals
            .iter()
            .find(|g| g.kind == GoalKind::WordCount)
            .unwrap();
        assert!(word_goal.met);
        assert!(
            report
                .phases
                .iter()
                .any(|p| p.name == CONTENT_EXPANSION && p.inserted),
            "expansion phase was inserted mid-run"
        );
    }

    #[tokio::test]
    async fn timeout_inserts_quick_generation_recovery() {
        let ctx = RunContext::new();
        let storage = Arc::new(MemoryStorage::new());
        let mut orchestrator = orchestrator_with(
            Arc::new(FixedAgent {
                response: String::new(),
            }),
            Arc::clone(&storage),
        );
        orchestrator.register_phase(Arc::new(StallingPhase));
        let quick = Arc::new(WordsPhase::new(QUICK_GENERATION, 50));
        orchestrator.register_recovery_phase(Arc::clone(&quick) as Arc<dyn Phase>);

        let report = orchestrator.run(&ctx, "summarize this").await.unwrap();
        assert!(report.success);
        assert!(quick.calls.load(Ordering::SeqCst) >= 1);
        assert!(
            report
                .phases
                .iter()
                .any(|p| p.name == QUICK_GENERATION && p.inserted)
        );
    }

    #[tokio::test]
    async fn stage_verifier_failure_inserts_quality_refinement() {
        use crate::verify::writing_verifier;

        let ctx = RunContext::new();
        let storage = Arc::new(MemoryStorage::new());
        let mut orchestrator = orchestrator_with(
            Arc::new(FixedAgent {
                response: String::new(),
            }),
            Arc::clone(&storage),
        );
        orchestrator.register_phase(Arc::new(WordsPhase::new("Drafting", 3)));
        let refine = Arc::new(WordsPhase::new(QUALITY_REFINEMENT, 40));
        orchestrator.register_recovery_phase(Arc::clone(&refine) as Arc<dyn Phase>);
        // Drafting must produce at least 20 words; its 3 never pass.
        orchestrator.verifier().register("Drafting", writing_verifier(20));

        let report = orchestrator.run(&ctx, "summarize this").await.unwrap();

        assert!(report.success);
        assert!(refine.calls.load(Ordering::SeqCst) >= 1);
        assert!(
            report
                .phases
                .iter()
                .any(|p| p.name == QUALITY_REFINEMENT && p.inserted),
            "verification failure routed into a refinement phase"
        );
        let issue_reports = storage.list(&ctx, "issues/*.json").await.unwrap();
        assert_eq!(issue_reports.len(), 1, "exhausted verification documented");
    }

    #[tokio::test]
    async fn failing_run_returns_phase_error() {
        let ctx = RunContext::new();
        let storage = Arc::new(MemoryStorage::new());
        let mut orchestrator = orchestrator_with(
            Arc::new(FixedAgent {
                response: String::new(),
            }),
            Arc::clone(&storage),
        );
        // No recovery phase registered and no recovery hints available.
        orchestrator.register_phase(Arc::new(StallingPhase));

        let err = orchestrator.run(&ctx, "summarize this").await.unwrap_err();
        assert_eq!(err.phase, "Stalling");
        assert!(matches!(err.source, PipelineError::Timeout { .. }));
    }

    #[tokio::test]
    async fn unified_iteration_runs_when_goals_stay_unmet() {
        let ctx = RunContext::new();
        let storage = Arc::new(MemoryStorage::new());
        // Agent keeps answering with a tiny text, so no pass can meet the goal.
        let mut orchestrator = orchestrator_with(
            Arc::new(FixedAgent {
                response: "too short".into(),
            }),
            Arc::clone(&storage),
        );
        orchestrator.register_phase(Arc::new(WordsPhase::new("Drafting", 100)));

        let report = orchestrator
            .run(&ctx, "Write a 20,000 word story")
            .await
            .unwrap();

        assert!(!report.success);
        assert!(
            report.phases.iter().any(|p| p.name == UNIFIED_ITERATION),
            "unified iteration attempted as the last resort"
        );
    }

    #[tokio::test]
    async fn successful_run_records_learned_sequence() {
        let ctx = RunContext::new();
        let storage = Arc::new(MemoryStorage::new());
        let mut orchestrator = orchestrator_with(
            Arc::new(FixedAgent {
                response: String::new(),
            }),
            Arc::clone(&storage),
        );
        orchestrator.register_phase(Arc::new(WordsPhase::new("Drafting", 500)));

        let report = orchestrator.run(&ctx, "Write a 400 word story").await.unwrap();
        assert!(report.success);
        assert!(storage.exists(&ctx, "patterns/fiction.json").await);

        let bytes = storage.load(&ctx, "patterns/fiction.json").await.unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["phases"][0], json!("Drafting"));
    }

    #[tokio::test]
    async fn run_persists_report_and_artifact() {
        let ctx = RunContext::new();
        let storage = Arc::new(MemoryStorage::new());
        let mut orchestrator = orchestrator_with(
            Arc::new(FixedAgent {
                response: String::new(),
            }),
            Arc::clone(&storage),
        );
        orchestrator.register_phase(Arc::new(WordsPhase::new("Drafting", 500)));

        let report = orchestrator.run(&ctx, "Write a 400 word story").await.unwrap();
        assert!(storage.exists(&ctx, &report.report_path()).await);
        assert!(
            storage
                .exists(&ctx, &format!("artifacts/{}.md", report.session_id))
                .await
        );
    }

    #[tokio::test]
    async fn resume_continues_from_checkpoint_data() {
        let ctx = RunContext::new();
        let storage = Arc::new(MemoryStorage::new());
        let mut orchestrator = orchestrator_with(
            Arc::new(FixedAgent {
                response: String::new(),
            }),
            Arc::clone(&storage),
        );
        let drafting = Arc::new(WordsPhase::new("Drafting", 500));
        orchestrator.register_phase(Arc::clone(&drafting) as Arc<dyn Phase>);
        orchestrator.register_phase(Arc::new(DoublerPhase));

        let session_id = SessionId::from_string("resume-test");
        let manager = orchestrator.checkpoints().unwrap();
        manager
            .save(
                &ctx,
                Checkpoint::new(
                    session_id.clone(),
                    1,
                    "Drafting",
                    "req",
                    Value::String(repeated_words(500)),
                ),
            )
            .await
            .unwrap();

        let report = orchestrator
            .resume(&ctx, "continue the story", session_id.clone(), 1)
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(drafting.calls.load(Ordering::SeqCst), 0, "phase 0 not re-run");
        // The doubler saw the checkpointed 500 words.
        assert_eq!(report.final_word_count, 1000);

        let checkpoint = manager.load(&ctx, &session_id).await.unwrap().unwrap();
        assert_eq!(checkpoint.resume_count, 1);
    }

    #[test]
    fn quality_score_penalizes_retries_and_overrun() {
        let estimate = Duration::from_secs(10);
        let fast = quality_score(1, Duration::from_secs(2), estimate);
        assert!((fast - 1.0).abs() < f64::EPSILON);

        let retried = quality_score(3, Duration::from_secs(2), estimate);
        assert!((retried - 0.7).abs() < 1e-9);

        let overran = quality_score(1, Duration::from_secs(30), estimate);
        assert!(overran < 1.0);

        let cached = quality_score(0, Duration::ZERO, estimate);
        assert!((cached - 1.0).abs() < f64::EPSILON);
    }
}
