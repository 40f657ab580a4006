//! Pipeline error types.
//!
//! Only infrastructure failures surface as `Err` from the executor;
//! step-level failures and stop conditions are encoded in
//! [`klartext_protocol::PipelineOutcome`] variants.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The pipeline configuration is structurally invalid. Surfaces at
    /// job start with an operator-facing message.
    #[error("Invalid pipeline configuration: {0}")]
    Config(String),

    /// The state store failed after retries.
    #[error("Storage error: {0}")]
    Db(#[from] klartext_db::DbError),
}

impl PipelineError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
