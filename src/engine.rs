//! The phase execution engine.
//!
//! Runs a sequence of phases in order with input/output validation, a
//! per-phase timeout derived from the phase's estimated duration, a bounded
//! retry loop, checkpointing after every completed phase, and an optional
//! fingerprint-keyed result cache. With a stage verifier attached, every
//! attempt's output also passes the registered verifier, and exhausted
//! failures are documented as issue reports.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{ResultCache, fingerprint};
use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::config::OrchestratorConfig;
use crate::errors::{PhaseError, PipelineError};
use crate::phase::{Phase, PhaseInput, PhaseOutput};
use crate::pool::ParallelExecutor;
use crate::session::{RunContext, SessionId};
use crate::verify::StageVerifier;

/// Outcome of a single phase execution, with the attempt count for
/// quality scoring. `attempts == 0` means the output came from the cache.
#[derive(Debug)]
pub struct PhaseExecution {
    pub output: PhaseOutput,
    pub attempts: u32,
    pub duration: Duration,
}

/// Ordered, validated, retried, checkpointed phase execution.
pub struct ExecutionEngine {
    max_retries: u32,
    base_delay: Duration,
    cache: Option<Arc<ResultCache>>,
    checkpoints: Option<Arc<CheckpointManager>>,
    verifier: Option<Arc<StageVerifier>>,
}

impl ExecutionEngine {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            base_delay: config.base_delay,
            cache: None,
            checkpoints: None,
            verifier: None,
        }
    }

    /// Enable the fingerprint-keyed output cache (optimized mode).
    pub fn with_cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: Arc<CheckpointManager>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    /// Route every phase attempt through a stage verifier. The verifier's
    /// retry limit replaces the engine's own loop for verified phases.
    pub fn with_verifier(mut self, verifier: Arc<StageVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Run `phases[start_phase..]` in order.
    ///
    /// With `start_phase > 0` the previous output's data is restored from
    /// the session checkpoint, so phases before the start index are not
    /// re-executed. An empty slice (or `start_phase == phases.len()`)
    /// succeeds with an empty output.
    pub async fn execute(
        &self,
        ctx: &RunContext,
        phases: &[Arc<dyn Phase>],
        request: &str,
        session_id: &SessionId,
        start_phase: usize,
    ) -> Result<PhaseOutput, PhaseError> {
        if start_phase >= phases.len() {
            return Ok(PhaseOutput::empty(request, session_id.clone()));
        }

        let mut previous_data = Value::Null;
        if start_phase > 0
            && let Some(manager) = &self.checkpoints
        {
            match manager.load(ctx, session_id).await {
                Ok(Some(checkpoint)) => {
                    debug!(
                        session = %session_id,
                        phase_index = checkpoint.phase_index,
                        "resuming from checkpoint"
                    );
                    previous_data = checkpoint.last_output();
                }
                Ok(None) => {
                    warn!(session = %session_id, start_phase, "no checkpoint to resume from");
                }
                Err(e) => {
                    return Err(PhaseError::new(
                        phases[start_phase].name(),
                        0,
                        e,
                    ));
                }
            }
        }

        let mut last_output = PhaseOutput::empty(request, session_id.clone());
        for (index, phase) in phases.iter().enumerate().skip(start_phase) {
            let input = PhaseInput::new(request, session_id.clone()).with_data(previous_data);
            let execution = self.execute_phase(ctx, phase, input).await?;
            last_output = execution.output;
            previous_data = last_output.data.clone();

            if let Some(manager) = &self.checkpoints {
                let checkpoint = Checkpoint::new(
                    session_id.clone(),
                    index + 1,
                    phase.name(),
                    request,
                    last_output.data.clone(),
                );
                manager
                    .save(ctx, checkpoint)
                    .await
                    .map_err(|e| PhaseError::new(phase.name(), execution.attempts, e))?;
            }
        }
        Ok(last_output)
    }

    /// Execute one phase with validation, timeout, retries, caching, and
    /// (when attached) stage verification.
    ///
    /// The orchestrator calls this directly so it can mutate the phase
    /// sequence between phases.
    pub async fn execute_phase(
        &self,
        ctx: &RunContext,
        phase: &Arc<dyn Phase>,
        input: PhaseInput,
    ) -> Result<PhaseExecution, PhaseError> {
        let name = phase.name().to_string();
        let started = std::time::Instant::now();

        let cache_key = self
            .cache
            .as_ref()
            .map(|_| fingerprint(&name, &input.request, &input.data));
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key)
            && let Some(cached) = cache.get(key)
        {
            info!(phase = %name, "cache hit, skipping execution");
            return Ok(PhaseExecution {
                output: cached,
                attempts: 0,
                duration: started.elapsed(),
            });
        }

        if let Err(e) = phase.validate_input(&input).await {
            let mut err = PhaseError::new(&name, 0, e);
            err.retryable = false;
            return Err(err);
        }

        let execution = if let Some(verifier) = &self.verifier {
            self.execute_verified(ctx, phase, &name, input, verifier, started)
                .await?
        } else {
            self.execute_unverified(ctx, phase, &name, input, started)
                .await?
        };

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            cache.insert(key.clone(), execution.output.clone());
        }
        Ok(execution)
    }

    /// One attempt: timeout-bounded execute plus output validation. A
    /// validation failure surfaces the produced output as the partial.
    async fn run_attempt(
        &self,
        ctx: &RunContext,
        phase: &Arc<dyn Phase>,
        input: PhaseInput,
    ) -> Result<PhaseOutput, (PipelineError, Option<PhaseOutput>)> {
        let timeout = phase.estimated_duration();
        match ctx
            .run_with_timeout(timeout, phase.execute(ctx, input))
            .await
        {
            Ok(Ok(output)) => match phase.validate_output(&output).await {
                Ok(()) => Ok(output),
                Err(e) => Err((e, Some(output))),
            },
            Ok(Err(e)) => Err((e, None)),
            Err(e) => Err((e, None)), // timeout or cancellation
        }
    }

    /// The engine's own retry loop, used when no verifier is attached.
    async fn execute_unverified(
        &self,
        ctx: &RunContext,
        phase: &Arc<dyn Phase>,
        name: &str,
        input: PhaseInput,
        started: std::time::Instant,
    ) -> Result<PhaseExecution, PhaseError> {
        let mut partial: Option<PhaseOutput> = None;

        for attempt in 1..=self.max_retries {
            if let Err(e) = ctx.check() {
                return Err(PhaseError::new(name, attempt, e));
            }
            debug!(phase = %name, attempt, "executing phase");

            match self.run_attempt(ctx, phase, input.clone()).await {
                Ok(output) => {
                    info!(
                        phase = %name,
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "phase completed"
                    );
                    return Ok(PhaseExecution {
                        output,
                        attempts: attempt,
                        duration: started.elapsed(),
                    });
                }
                Err((e, attempt_partial)) => {
                    if attempt_partial.is_some() {
                        partial = attempt_partial;
                    }
                    let retryable = phase.can_retry(&e);
                    warn!(phase = %name, attempt, retryable, error = %e, "phase attempt failed");
                    if !retryable || attempt == self.max_retries {
                        let mut err = PhaseError::new(name, attempt, e);
                        err.retryable = retryable;
                        if let Some(partial) = partial {
                            err = err.with_partial(partial);
                        }
                        return Err(err);
                    }
                    // Linear backoff: attempt n waits n delay units.
                    if let Err(e) = ctx.sleep(self.base_delay * attempt).await {
                        return Err(PhaseError::new(name, attempt, e));
                    }
                }
            }
        }
        unreachable!("retry loop always returns")
    }

    /// Per-phase flow when a verifier is attached: the verifier drives the
    /// retries, each attempt being execute + output validation, and its
    /// registered check judges every attempt's output. Exhausted failures
    /// are documented as issue reports before the error is returned.
    async fn execute_verified(
        &self,
        ctx: &RunContext,
        phase: &Arc<dyn Phase>,
        name: &str,
        input: PhaseInput,
        verifier: &Arc<StageVerifier>,
        started: std::time::Instant,
    ) -> Result<PhaseExecution, PhaseError> {
        #[derive(Default)]
        struct AttemptState {
            output: Option<PhaseOutput>,
            error: Option<PipelineError>,
            partial: Option<PhaseOutput>,
        }

        let session_id = input.session_id.clone();
        let state: Mutex<AttemptState> = Mutex::new(AttemptState::default());

        let stage_result = verifier
            .verify_stage_with_retry_for(
                ctx,
                &session_id,
                name,
                |attempt| {
                    let input = input.clone();
                    let state = &state;
                    async move {
                        debug!(phase = %name, attempt, "executing phase");
                        match self.run_attempt(ctx, phase, input).await {
                            Ok(output) => {
                                let text = output.data_as_text();
                                let mut s = state.lock().await;
                                s.output = Some(output);
                                s.error = None;
                                Ok(text)
                            }
                            Err((e, partial)) => {
                                let mut s = state.lock().await;
                                s.error = Some(e.clone());
                                s.output = None;
                                if partial.is_some() {
                                    s.partial = partial;
                                }
                                Err(e)
                            }
                        }
                    }
                },
                |e| phase.can_retry(e),
            )
            .await
            .map_err(|e| PhaseError::new(name, 0, e))?;

        let state = state.into_inner();
        if stage_result.success {
            let output = state.output.ok_or_else(|| {
                PhaseError::new(
                    name,
                    stage_result.attempts,
                    PipelineError::other("verified stage produced no output record"),
                )
            })?;
            info!(
                phase = %name,
                attempts = stage_result.attempts,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "phase completed and verified"
            );
            return Ok(PhaseExecution {
                output,
                attempts: stage_result.attempts,
                duration: started.elapsed(),
            });
        }

        // The last attempt either errored outright or failed verification.
        let source = match state.error {
            Some(e) => e,
            None => PipelineError::VerificationFailed {
                stage: name.to_string(),
                issues: stage_result.issues.clone(),
            },
        };
        let retryable = phase.can_retry(&source);
        let mut err = PhaseError::new(name, stage_result.attempts, source);
        err.retryable = retryable;
        if let Some(partial) = state.partial.or(state.output) {
            err = err.with_partial(partial);
        }
        Err(err)
    }

    /// Run mutually independent phases concurrently against the same input
    /// data. Pipelines whose phases depend on predecessors stay on
    /// [`ExecutionEngine::execute`]; small batches run sequentially.
    pub async fn execute_independent(
        &self,
        ctx: &RunContext,
        phases: Vec<Arc<dyn Phase>>,
        request: &str,
        session_id: &SessionId,
        data: Value,
        workers: usize,
    ) -> Vec<Result<PhaseExecution, PhaseError>> {
        let engine = self.clone_for_workers();
        let request = request.to_string();
        let session_id = session_id.clone();
        let run_ctx = ctx.clone();

        let results = ParallelExecutor::new(workers)
            .run_all(ctx, phases, move |phase| {
                let engine = engine.clone();
                let input = PhaseInput::new(request.clone(), session_id.clone())
                    .with_data(data.clone());
                let ctx = run_ctx.clone();
                async move { engine.execute_phase(&ctx, &phase, input).await }
            })
            .await;

        results
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    Err(PhaseError::new("(unscheduled)", 0, PipelineError::Canceled))
                })
            })
            .collect()
    }

    fn clone_for_workers(&self) -> Arc<ExecutionEngine> {
        Arc::new(ExecutionEngine {
            max_retries: self.max_retries,
            base_delay: self.base_delay,
            cache: self.cache.clone(),
            checkpoints: self.checkpoints.clone(),
            verifier: self.verifier.clone(),
        })
    }
}
