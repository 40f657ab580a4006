//! Pipeline resolver and executor.
//!
//! The resolver materializes an immutable [`plan::ExecutionPlan`] from a
//! configuration snapshot (pre-branch -> classifier -> class-specific ->
//! post-branch); the executor drives one job through the plan against an
//! LLM provider, threading a mutable run context, honoring gating,
//! stop conditions, retries and cooperative cancellation, and recording
//! every attempt in the encrypted step store plus the cost ledger.

pub mod context;
pub mod error;
pub mod executor;
pub mod plan;

pub use context::RunContext;
pub use error::PipelineError;
pub use executor::{ExecutorConfig, PipelineExecutor};
pub use plan::{ExecutionPlan, StepKind};
