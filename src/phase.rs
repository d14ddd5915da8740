//! The phase seam and its input/output envelopes.
//!
//! A phase is one unit of pipeline work: it validates its input, executes
//! (usually by prompting an agent), and validates its output. Phases are
//! registered once per orchestrator and reused across requests; identity is
//! the name.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::PipelineError;
use crate::session::{RunContext, SessionId};

/// Input handed to a phase: the user request plus the previous stage's data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseInput {
    pub request: String,
    pub session_id: SessionId,
    /// Previous stage's output data (opaque to the engine).
    pub data: Value,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl PhaseInput {
    pub fn new(request: impl Into<String>, session_id: SessionId) -> Self {
        Self {
            request: request.into(),
            session_id,
            data: Value::Null,
            metadata: HashMap::new(),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// The data rendered as text, for word counting and prompting.
    /// String payloads come back verbatim, anything else as JSON.
    pub fn data_as_text(&self) -> String {
        match &self.data {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Output produced by a phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseOutput {
    pub request: String,
    pub session_id: SessionId,
    pub data: Value,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Soft error the phase surfaced without failing outright.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhaseOutput {
    pub fn new(input: &PhaseInput, data: Value) -> Self {
        Self {
            request: input.request.clone(),
            session_id: input.session_id.clone(),
            data,
            metadata: HashMap::new(),
            error: None,
        }
    }

    /// An empty output for a run that executed no phases.
    pub fn empty(request: impl Into<String>, session_id: SessionId) -> Self {
        Self {
            request: request.into(),
            session_id,
            data: Value::Null,
            metadata: HashMap::new(),
            error: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Artifacts extracted from the `artifacts` metadata object, if present.
    pub fn artifacts(&self) -> HashMap<String, Value> {
        match self.metadata.get("artifacts") {
            Some(Value::Object(map)) => map.clone().into_iter().collect(),
            _ => HashMap::new(),
        }
    }

    pub fn data_as_text(&self) -> String {
        match &self.data {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// A unit of pipeline work with execute + validation + retry semantics.
#[async_trait]
pub trait Phase: Send + Sync {
    /// Immutable identity.
    fn name(&self) -> &str;

    /// Expected duration, used as the per-attempt timeout.
    fn estimated_duration(&self) -> Duration;

    async fn validate_input(&self, _input: &PhaseInput) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &RunContext,
        input: PhaseInput,
    ) -> Result<PhaseOutput, PipelineError>;

    async fn validate_output(&self, _output: &PhaseOutput) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Whether the engine should retry after this error.
    fn can_retry(&self, err: &PipelineError) -> bool {
        err.is_retryable()
    }
}

/// Ordered registry of phases, looked up by name for mid-run insertion.
#[derive(Default, Clone)]
pub struct PhaseRegistry {
    order: Vec<String>,
    phases: HashMap<String, Arc<dyn Phase>>,
}

impl PhaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a phase. Re-registering a name replaces the phase but keeps
    /// its original position.
    pub fn register(&mut self, phase: Arc<dyn Phase>) {
        let name = phase.name().to_string();
        if !self.phases.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.phases.insert(name, phase);
    }

    /// Register a phase for by-name lookup without adding it to the default
    /// order. Recovery and expansion phases are registered this way so the
    /// orchestrator can insert them mid-run.
    pub fn register_auxiliary(&mut self, phase: Arc<dyn Phase>) {
        self.phases.insert(phase.name().to_string(), phase);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Phase>> {
        self.phases.get(name).cloned()
    }

    /// Phases in registration order.
    pub fn ordered(&self) -> Vec<Arc<dyn Phase>> {
        self.order
            .iter()
            .filter_map(|n| self.phases.get(n).cloned())
            .collect()
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NoopPhase(String);

    #[async_trait]
    impl Phase for NoopPhase {
        fn name(&self) -> &str {
            &self.0
        }

        fn estimated_duration(&self) -> Duration {
            Duration::from_secs(1)
        }

        async fn execute(
            &self,
            _ctx: &RunContext,
            input: PhaseInput,
        ) -> Result<PhaseOutput, PipelineError> {
            Ok(PhaseOutput::new(&input, Value::Null))
        }
    }

    #[test]
    fn test_input_data_as_text() {
        let input = PhaseInput::new("req", SessionId::generate()).with_data(json!("hello world"));
        assert_eq!(input.data_as_text(), "hello world");

        let input = PhaseInput::new("req", SessionId::generate()).with_data(json!({"k": "v"}));
        assert_eq!(input.data_as_text(), r#"{"k":"v"}"#);

        let input = PhaseInput::new("req", SessionId::generate());
        assert_eq!(input.data_as_text(), "");
    }

    #[test]
    fn test_output_artifacts_extraction() {
        let input = PhaseInput::new("req", SessionId::generate());
        let output = PhaseOutput::new(&input, Value::Null).with_metadata(
            "artifacts",
            json!({"draft.md": "content", "outline.md": "sections"}),
        );

        let artifacts = output.artifacts();
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts.get("draft.md"), Some(&json!("content")));
    }

    #[test]
    fn test_output_artifacts_absent() {
        let input = PhaseInput::new("req", SessionId::generate());
        let output = PhaseOutput::new(&input, Value::Null);
        assert!(output.artifacts().is_empty());
    }

    #[test]
    fn test_output_serialization_round_trip() {
        let input = PhaseInput::new("req", SessionId::from_string("s-1"));
        let output = PhaseOutput::new(&input, json!({"done": true}));

        let text = serde_json::to_string(&output).unwrap();
        let parsed: PhaseOutput = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.data, json!({"done": true}));
        assert_eq!(parsed.session_id.as_str(), "s-1");
        assert!(parsed.error.is_none());
    }

    #[test]
    fn test_registry_preserves_order_and_replaces_by_name() {
        let mut registry = PhaseRegistry::new();
        registry.register(Arc::new(NoopPhase("Analysis".into())));
        registry.register(Arc::new(NoopPhase("Drafting".into())));
        registry.register(Arc::new(NoopPhase("Analysis".into())));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), &["Analysis", "Drafting"]);
        assert!(registry.get("Drafting").is_some());
        assert!(registry.get("Missing").is_none());
    }

    #[tokio::test]
    async fn test_default_validations_accept_anything() {
        let phase = NoopPhase("Noop".into());
        let input = PhaseInput::new("req", SessionId::generate());
        assert!(phase.validate_input(&input).await.is_ok());
        let output = PhaseOutput::new(&input, Value::Null);
        assert!(phase.validate_output(&output).await.is_ok());
    }
}
