//! End-to-end scenarios for the maestro orchestration library.
//!
//! These exercise the public API the way an embedding CLI would: real
//! filesystem storage, full engine/orchestrator flows, resume after a
//! simulated crash, and streaming unit retries.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tempfile::tempdir;

use maestro::checkpoint::{Checkpoint, CheckpointManager};
use maestro::config::OrchestratorConfig;
use maestro::engine::ExecutionEngine;
use maestro::progress::{ProgressTracker, unit_key};
use maestro::{
    Agent, FsStorage, Phase, PhaseInput, PhaseOutput, PipelineError, RunContext, SessionId,
    Storage,
};

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        max_retries: 3,
        base_delay: Duration::from_millis(1),
        ..OrchestratorConfig::default()
    }
}

/// A phase that fails a scripted number of times, then emits fixed data.
struct ScriptedPhase {
    name: String,
    failures: u32,
    error: fn() -> PipelineError,
    calls: AtomicU32,
    output: Value,
}

impl ScriptedPhase {
    fn ok(name: &str, output: Value) -> Self {
        Self {
            name: name.into(),
            failures: 0,
            error: || PipelineError::other("unused"),
            calls: AtomicU32::new(0),
            output,
        }
    }

    fn flaky(name: &str, failures: u32, output: Value) -> Self {
        Self {
            name: name.into(),
            failures,
            error: || PipelineError::Network("connection reset".into()),
            calls: AtomicU32::new(0),
            output,
        }
    }

    fn terminal(name: &str) -> Self {
        Self {
            name: name.into(),
            failures: u32::MAX,
            error: || PipelineError::PromptTooLarge { chars: 999_999 },
            calls: AtomicU32::new(0),
            output: Value::Null,
        }
    }
}

#[async_trait]
impl Phase for ScriptedPhase {
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
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            Err((self.error)())
        } else {
            Ok(PhaseOutput::new(&input, self.output.clone()))
        }
    }
}

struct EchoAgent;

#[async_trait]
impl Agent for EchoAgent {
    async fn execute(
        &self,
        _ctx: &RunContext,
        _prompt: &str,
        _input: Option<&Value>,
    ) -> Result<String, PipelineError> {
        Ok(String::new())
    }
}

mod engine_scenarios {
    use super::*;

    #[tokio::test]
    async fn happy_path_two_phases_leaves_final_checkpoint() {
        let dir = tempdir().unwrap();
        let ctx = RunContext::new();
        let storage: Arc<dyn Storage> = Arc::new(FsStorage::new(dir.path()));
        let manager = Arc::new(CheckpointManager::new(Arc::clone(&storage)));
        let engine = ExecutionEngine::new(&fast_config()).with_checkpoints(Arc::clone(&manager));

        let phases: Vec<Arc<dyn Phase>> = vec![
            Arc::new(ScriptedPhase::ok("A", json!({"k": "v"}))),
            Arc::new(ScriptedPhase::ok("B", json!({"done": true}))),
        ];
        let session = SessionId::from_string("happy-path");

        let output = engine
            .execute(&ctx, &phases, "req", &session, 0)
            .await
            .unwrap();
        assert_eq!(output.data, json!({"done": true}));

        let checkpoint = manager.load(&ctx, &session).await.unwrap().unwrap();
        assert_eq!(checkpoint.phase_index, 2);
        assert_eq!(checkpoint.last_output(), json!({"done": true}));
    }

    #[tokio::test]
    async fn retry_then_succeed_executes_exactly_three_times() {
        let ctx = RunContext::new();
        let engine = ExecutionEngine::new(&fast_config());
        let phase = Arc::new(ScriptedPhase::flaky("A", 2, json!("ok")));
        let phases: Vec<Arc<dyn Phase>> = vec![Arc::clone(&phase) as Arc<dyn Phase>];

        let output = engine
            .execute(&ctx, &phases, "req", &SessionId::generate(), 0)
            .await
            .unwrap();
        assert_eq!(output.data, json!("ok"));
        assert_eq!(phase.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_reports_first_attempt() {
        let dir = tempdir().unwrap();
        let ctx = RunContext::new();
        let storage: Arc<dyn Storage> = Arc::new(FsStorage::new(dir.path()));
        let manager = Arc::new(CheckpointManager::new(Arc::clone(&storage)));
        let engine = ExecutionEngine::new(&fast_config()).with_checkpoints(Arc::clone(&manager));

        let phases: Vec<Arc<dyn Phase>> = vec![Arc::new(ScriptedPhase::terminal("A"))];
        let session = SessionId::from_string("terminal");

        let err = engine
            .execute(&ctx, &phases, "req", &session, 0)
            .await
            .unwrap_err();
        assert_eq!(err.attempt, 1);
        assert!(!err.retryable);
        assert!(
            manager.load(&ctx, &session).await.unwrap().is_none(),
            "no checkpoint was written for the failed phase"
        );
    }

    #[tokio::test]
    async fn resume_after_crash_continues_from_checkpoint() {
        let dir = tempdir().unwrap();
        let ctx = RunContext::new();
        let session = SessionId::from_string("crashy");

        // First process: A and B complete, the process dies during C.
        {
            let storage: Arc<dyn Storage> = Arc::new(FsStorage::new(dir.path()));
            let manager = Arc::new(CheckpointManager::new(Arc::clone(&storage)));
            let engine =
                ExecutionEngine::new(&fast_config()).with_checkpoints(Arc::clone(&manager));
            let phases: Vec<Arc<dyn Phase>> = vec![
                Arc::new(ScriptedPhase::ok("A", json!("a-out"))),
                Arc::new(ScriptedPhase::ok("B", json!("b-out"))),
            ];
            engine
                .execute(&ctx, &phases, "req", &session, 0)
                .await
                .unwrap();
        }

        // Second process resumes at C and sees B's output as its input.
        let storage: Arc<dyn Storage> = Arc::new(FsStorage::new(dir.path()));
        let manager = Arc::new(CheckpointManager::new(Arc::clone(&storage)));
        let engine = ExecutionEngine::new(&fast_config()).with_checkpoints(Arc::clone(&manager));

        struct InputWitness;

        #[async_trait]
        impl Phase for InputWitness {
            fn name(&self) -> &str {
                "C"
            }

            fn estimated_duration(&self) -> Duration {
                Duration::from_secs(5)
            }

            async fn execute(
                &self,
                _ctx: &RunContext,
                input: PhaseInput,
            ) -> Result<PhaseOutput, PipelineError> {
                assert_eq!(input.data, json!("b-out"), "resume must see B's output");
                Ok(PhaseOutput::new(&input, json!("c-out")))
            }
        }

        let a = Arc::new(ScriptedPhase::ok("A", json!("a-out")));
        let b = Arc::new(ScriptedPhase::ok("B", json!("b-out")));
        let phases: Vec<Arc<dyn Phase>> = vec![
            Arc::clone(&a) as Arc<dyn Phase>,
            Arc::clone(&b) as Arc<dyn Phase>,
            Arc::new(InputWitness),
        ];

        let output = engine
            .execute(&ctx, &phases, "req", &session, 2)
            .await
            .unwrap();
        assert_eq!(output.data, json!("c-out"));
        assert_eq!(a.calls.load(Ordering::SeqCst), 0);
        assert_eq!(b.calls.load(Ordering::SeqCst), 0);

        let checkpoint = manager.load(&ctx, &session).await.unwrap().unwrap();
        assert_eq!(checkpoint.phase_index, 3);
    }

    #[tokio::test]
    async fn resume_equivalence_with_continuous_run() {
        // Deterministic phases: a continuous run and a resumed run produce
        // the same final artifact.
        let ctx = RunContext::new();
        let make_phases = || -> Vec<Arc<dyn Phase>> {
            vec![
                Arc::new(ScriptedPhase::ok("P1", json!(1))),
                Arc::new(ScriptedPhase::ok("P2", json!(2))),
                Arc::new(ScriptedPhase::ok("P3", json!(3))),
            ]
        };

        let continuous = {
            let dir = tempdir().unwrap();
            let storage: Arc<dyn Storage> = Arc::new(FsStorage::new(dir.path()));
            let engine = ExecutionEngine::new(&fast_config())
                .with_checkpoints(Arc::new(CheckpointManager::new(storage)));
            engine
                .execute(&ctx, &make_phases(), "req", &SessionId::from_string("s1"), 0)
                .await
                .unwrap()
        };

        let resumed = {
            let dir = tempdir().unwrap();
            let storage: Arc<dyn Storage> = Arc::new(FsStorage::new(dir.path()));
            let manager = Arc::new(CheckpointManager::new(Arc::clone(&storage)));
            let session = SessionId::from_string("s2");
            manager
                .save(&ctx, Checkpoint::new(session.clone(), 2, "P2", "req", json!(2)))
                .await
                .unwrap();
            let engine =
                ExecutionEngine::new(&fast_config()).with_checkpoints(Arc::clone(&manager));
            engine
                .execute(&ctx, &make_phases(), "req", &session, 2)
                .await
                .unwrap()
        };

        assert_eq!(continuous.data, resumed.data);
    }
}

mod orchestrator_scenarios {
    use super::*;
    use maestro::Orchestrator;
    use maestro::goals::GoalKind;

    /// Doubles whatever text it receives.
    struct Doubler;

    #[async_trait]
    impl Phase for Doubler {
        fn name(&self) -> &str {
            maestro::orchestrator::CONTENT_EXPANSION
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
            Ok(PhaseOutput::new(&input, Value::String(format!("{text} {text}"))))
        }
    }

    struct Drafter {
        words: usize,
    }

    #[async_trait]
    impl Phase for Drafter {
        fn name(&self) -> &str {
            "Drafting"
        }

        fn estimated_duration(&self) -> Duration {
            Duration::from_secs(5)
        }

        async fn execute(
            &self,
            _ctx: &RunContext,
            input: PhaseInput,
        ) -> Result<PhaseOutput, PipelineError> {
            let text = "word ".repeat(self.words).trim_end().to_string();
            Ok(PhaseOutput::new(&input, Value::String(text)))
        }
    }

    #[tokio::test]
    async fn goal_aware_expansion_meets_word_count_goal() {
        let dir = tempdir().unwrap();
        let ctx = RunContext::new();
        let storage: Arc<dyn Storage> = Arc::new(FsStorage::new(dir.path()));
        let mut orchestrator = Orchestrator::new(fast_config(), Arc::new(EchoAgent), storage);
        orchestrator.register_phase(Arc::new(Drafter { words: 9_000 }));
        orchestrator.register_recovery_phase(Arc::new(Doubler));

        let report = orchestrator
            .run(&ctx, "Write a 20,000 word story")
            .await
            .unwrap();

        assert!(report.success);
        assert!(report.final_word_count >= 18_000, "90% threshold");
        let word_goal = report
            .goals
            .iter()
            .find(|g| g.kind == GoalKind::WordCount)
            .unwrap();
        assert!(word_goal.met, "goal tracker reports word_count met");
    }
}

mod streaming_scenarios {
    use super::*;

    #[tokio::test]
    async fn streaming_writer_retries_failed_unit() {
        let dir = tempdir().unwrap();
        let ctx = RunContext::new();
        let storage: Arc<dyn Storage> = Arc::new(FsStorage::new(dir.path()));
        let session = SessionId::from_string("stream-1");
        let tracker = ProgressTracker::new(Arc::clone(&storage), session.clone(), 10);

        for unit in 1..=10usize {
            let key = unit_key(1, unit);
            if unit == 4 {
                // First attempt fails with a retryable error, second works.
                tracker
                    .mark_failed(&ctx, &key, 1, "rate limited", true)
                    .await
                    .unwrap();
            }
            tracker
                .mark_completed(&ctx, &key, &format!("scene {unit} content"))
                .await
                .unwrap();
        }

        let stats = tracker.stats().await;
        assert_eq!(stats.completed_count(), 10);
        assert_eq!(stats.failed_count(), 0);
        assert!(stats.is_complete());

        // Unit 4's content file exists and holds the successful content.
        let content = tracker.unit_content(&ctx, &unit_key(1, 4)).await.unwrap();
        assert_eq!(content, "scene 4 content");

        // The progress file is durable and reloadable.
        let resumed = ProgressTracker::load_or_new(&ctx, storage, session, 10)
            .await
            .unwrap();
        assert_eq!(resumed.stats().await.completed_count(), 10);
    }
}
