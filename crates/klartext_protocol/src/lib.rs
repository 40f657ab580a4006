//! Shared types for the Klartext document pipeline.
//!
//! Everything that crosses a crate boundary lives here: job, step and
//! broker-task status enums, recognized processing options, the
//! executor's outcome variants, cooperative cancellation, and the
//! canonical default values used by the scheduler and worker pool.

pub mod cancel;
pub mod config;
pub mod defaults;
pub mod types;

// Re-export the canonical enums so downstream crates never spell out
// the module path.
pub use types::{
    JobStatus, OutputFormat, PipelineOutcome, ProcessingOptions, StepStatus, StopConditions,
    TaskStatus,
};

pub use cancel::CancellationToken;
pub use config::SystemConfig;
