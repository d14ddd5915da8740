//! The agent seam: prompt in, text out.
//!
//! Concrete phases and strategies consume an [`Agent`] to do their actual
//! work. The orchestrator only touches it for the final unified iteration.

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::PipelineError;
use crate::session::RunContext;

/// A text-completion agent.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Execute a prompt, optionally with structured input appended.
    async fn execute(
        &self,
        ctx: &RunContext,
        prompt: &str,
        input: Option<&Value>,
    ) -> Result<String, PipelineError>;

    /// Execute a prompt expected to yield a JSON object.
    ///
    /// The default implementation locates the first complete JSON object in
    /// the raw response; agents that enforce JSON mode can override.
    async fn execute_json(
        &self,
        ctx: &RunContext,
        prompt: &str,
        input: Option<&Value>,
    ) -> Result<String, PipelineError> {
        let raw = self.execute(ctx, prompt, input).await?;
        match first_json_object(&raw) {
            Some(object) => Ok(object.to_string()),
            None => Err(PipelineError::Parse(format!(
                "agent response carries no complete JSON object ({} chars)",
                raw.len()
            ))),
        }
    }
}

/// Locate the first balanced JSON object in free-form agent output.
///
/// Depth is tracked only outside string literals, so braces inside quoted
/// values (including escaped quotes) do not unbalance the scan.
fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, byte) in text.as_bytes()[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}
