//! Recognized configuration options and their defaults.
//!
//! Three groups mirror the components they drive: the orchestrator-level
//! [`OrchestratorConfig`], the retry/backoff [`ResilienceConfig`], and the
//! improvement-engine [`ImprovementConfig`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Orchestrator-level options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Enable the checkpoint manager.
    pub checkpointing_enabled: bool,
    /// Per-phase retry limit.
    pub max_retries: u32,
    /// Enable the result cache and worker pool.
    pub performance_enabled: bool,
    /// Worker count; 0 means derive from available parallelism.
    pub max_concurrency: usize,
    /// Delay unit between phase retry attempts (attempt n waits n times this).
    #[serde(with = "duration_secs")]
    pub base_delay: Duration,
    /// Overall quality threshold below which a final unified iteration runs.
    pub target_quality: f64,
    /// Hard timeout for the final unified iteration.
    #[serde(with = "duration_secs")]
    pub final_iteration_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            checkpointing_enabled: true,
            max_retries: 3,
            performance_enabled: true,
            max_concurrency: 0,
            base_delay: Duration::from_secs(1),
            target_quality: 0.85,
            final_iteration_timeout: Duration::from_secs(600),
        }
    }
}

impl OrchestratorConfig {
    /// Effective worker count: the configured value, or available
    /// parallelism when set to 0.
    pub fn effective_concurrency(&self) -> usize {
        if self.max_concurrency > 0 {
            self.max_concurrency
        } else {
            default_worker_count()
        }
    }
}

/// Worker count derived from the host CPU.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(1)
}

/// Retry and fallback options for the resilience manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl ResilienceConfig {
    /// Delay before retry attempt `n` (1-based):
    /// `min(max_delay, base_delay * multiplier^(n-1))`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay = self.base_delay.mul_f64(factor);
        delay.min(self.max_delay)
    }
}

/// Which failing criteria the improvement engine attacks first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FocusMode {
    /// Lowest-scoring criteria first.
    #[default]
    WorstFirst,
    /// Highest-priority criteria first.
    Priority,
    /// Arbitrary order.
    Random,
}

/// Options for the iterative improvement engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImprovementConfig {
    pub max_iterations: u32,
    pub target_quality: f64,
    /// Quality delta under which an iteration counts as converged.
    pub convergence_threshold: f64,
    /// Run inspectors concurrently.
    pub parallel_criteria: bool,
    pub focus_mode: FocusMode,
    /// Failing criteria addressed per improvement step.
    pub batch_size: usize,
    /// Minimum accepted per-step improvement.
    pub min_improvement: f64,
    /// Steps with <1% cumulative improvement before adaptive strategies kick in.
    pub stagnation_threshold: usize,
    pub adaptive_learning: bool,
    /// Record an improvement checkpoint every this many steps.
    pub checkpoint_interval: u32,
}

impl Default for ImprovementConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            target_quality: 0.95,
            convergence_threshold: 0.001,
            parallel_criteria: false,
            focus_mode: FocusMode::default(),
            batch_size: 5,
            min_improvement: 0.0,
            stagnation_threshold: 5,
            adaptive_learning: true,
            checkpoint_interval: 10,
        }
    }
}

/// Result cache sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            ttl: Duration::from_secs(3600),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
