//! maestro — adaptive phase orchestration for AI-assisted pipelines.
//!
//! The crate drives an ordered set of phases against a request: each phase
//! is validated, executed under a timeout, verified, retried, and
//! checkpointed; an adaptive error handler suggests and learns recovery
//! strategies; a goal tracker and improvement engine keep iterating until
//! measurable targets and quality thresholds are met.

pub mod adaptive;
pub mod agent;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod errors;
pub mod goals;
pub mod improve;
pub mod orchestrator;
pub mod phase;
pub mod pool;
pub mod progress;
pub mod resilience;
pub mod session;
pub mod storage;
pub mod strategy;
pub mod telemetry;
pub mod util;
pub mod verify;

pub use agent::Agent;
pub use config::OrchestratorConfig;
pub use errors::{PhaseError, PipelineError};
pub use orchestrator::{Orchestrator, RunReport};
pub use phase::{Phase, PhaseInput, PhaseOutput};
pub use session::{RunContext, SessionId};
pub use storage::{FsStorage, MemoryStorage, Storage};
