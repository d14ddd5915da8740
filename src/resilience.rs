//! Retry with exponential backoff, plus registered fallbacks.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::config::ResilienceConfig;
use crate::errors::PipelineError;
use crate::session::RunContext;

/// An alternative handler tried when a primary operation fails.
#[async_trait]
pub trait Fallback: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, ctx: &RunContext, input: &Value) -> Result<Value, PipelineError>;
}

/// Retry and fallback coordination for classifiable operations.
pub struct ResilienceManager {
    config: ResilienceConfig,
    fallbacks: RwLock<HashMap<String, Vec<Arc<dyn Fallback>>>>,
}

impl ResilienceManager {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            fallbacks: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Run `op` up to `max_retries + 1` times with capped exponential
    /// backoff between attempts. Non-retryable errors abort immediately;
    /// cancellation is honored during waits.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        ctx: &RunContext,
        name: &str,
        op: F,
    ) -> Result<T, PipelineError>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let total_attempts = self.config.max_retries + 1;
        let mut last_err = PipelineError::other(format!("{name}: no attempts executed"));

        for attempt in 1..=total_attempts {
            ctx.check()?;
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op = name, attempt, "operation recovered after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => {
                    warn!(op = name, attempt, error = %e, "non-retryable failure");
                    return Err(e);
                }
                Err(e) => {
                    warn!(op = name, attempt, error = %e, "retryable failure");
                    last_err = e;
                }
            }

            if attempt < total_attempts {
                ctx.sleep(self.config.delay_for_attempt(attempt)).await?;
            }
        }
        Err(last_err)
    }

    /// Register a fallback for an operation name. Fallbacks run in
    /// insertion order.
    pub fn register_fallback(&self, op_name: impl Into<String>, fallback: Arc<dyn Fallback>) {
        self.fallbacks
            .write()
            .expect("fallback lock")
            .entry(op_name.into())
            .or_default()
            .push(fallback);
    }

    /// Try `primary`; on failure iterate registered fallbacks in order and
    /// return the first success. When everything fails, the last error wins.
    pub async fn execute_with_fallbacks<F, Fut>(
        &self,
        ctx: &RunContext,
        op_name: &str,
        primary: F,
        input: Value,
    ) -> Result<Value, PipelineError>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<Value, PipelineError>>,
    {
        match primary(input.clone()).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(op = op_name, error = %e, "primary failed, trying fallbacks");
                let chain: Vec<Arc<dyn Fallback>> = self
                    .fallbacks
                    .read()
                    .expect("fallback lock")
                    .get(op_name)
                    .cloned()
                    .unwrap_or_default();

                let mut last_err = e;
                for fallback in chain {
                    ctx.check()?;
                    match fallback.handle(ctx, &input).await {
                        Ok(value) => {
                            debug!(op = op_name, fallback = fallback.name(), "fallback succeeded");
                            return Ok(value);
                        }
                        Err(e) => {
                            warn!(op = op_name, fallback = fallback.name(), error = %e, "fallback failed");
                            last_err = e;
                        }
                    }
                }
                Err(last_err)
            }
        }
    }
}

impl Default for ResilienceManager {
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}
