//! Canonical enums and payload types.
//!
//! Status enums are stored as SCREAMING_SNAKE_CASE text columns, so the
//! sqlx derives here are the single source of truth for the wire and
//! storage encoding.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;

// ============================================================================
// Job lifecycle
// ============================================================================

/// Lifecycle state of a document processing job.
///
/// `Completed`, `Failed` and `Terminated` are absorbing: the store
/// refuses transitions out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Terminated,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Terminated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one attempted step invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Terminated,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
            Self::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a broker task row.
///
/// Distinct from [`JobStatus`]: a task can be redelivered (`Queued` again
/// after a stale claim) while the job it references stays `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Running,
    Acked,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Acked => "ACKED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

// ============================================================================
// Step configuration fragments
// ============================================================================

/// Expected shape of a step's LLM output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Text,
    Json,
    Markdown,
}

/// Early-termination sentinel configuration for a step.
///
/// The match rule is first-token, case-insensitive: the first
/// whitespace-separated token of the step output is uppercased and tested
/// against `stop_on_values`. A sentinel appearing anywhere else in the
/// output does not terminate. Prompts must be shaped to emit the sentinel
/// as the first token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopConditions {
    /// Uppercase sentinel tokens.
    pub stop_on_values: BTreeSet<String>,
    /// Machine-readable reason written into the job's result data.
    pub termination_reason: String,
    /// User-facing message written into the job's result data.
    pub termination_message: String,
}

impl StopConditions {
    /// Test an output against the sentinels; returns the matched token.
    pub fn matches(&self, output: &str) -> Option<String> {
        let first = output.split_whitespace().next()?;
        let token = first.to_uppercase();
        self.stop_on_values.contains(&token).then_some(token)
    }
}

// ============================================================================
// Broker payload and processing options
// ============================================================================

/// Recognized keys of a job's user options mapping.
///
/// Unknown keys are dropped at parse time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingOptions {
    /// Target language code (e.g. `de`, `en`, `fr`). Exposed to steps via
    /// the run context; enables steps gated on `target_language`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_language: Option<String>,

    /// Uppercase class key. When present the classification is seeded
    /// from the hint and the branching step's parsed result does not
    /// override it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_type_hint: Option<String>,
}

impl ProcessingOptions {
    /// Parse from the JSON mapping stored on the job row.
    pub fn from_json(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_default()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// The hint, normalized the way class keys are stored.
    pub fn normalized_hint(&self) -> Option<String> {
        self.document_type_hint
            .as_deref()
            .map(|h| h.trim().to_uppercase())
            .filter(|h| !h.is_empty())
    }
}

// ============================================================================
// Executor outcome
// ============================================================================

/// Terminal result of one pipeline execution.
///
/// Explicit variants instead of errors: a stop condition is a legitimate
/// end state, not a failure. The worker translates these into the job's
/// terminal status and `result_data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Completed {
        result: Map<String, Value>,
    },
    Failed {
        step_name: Option<String>,
        error: String,
    },
    Terminated {
        reason: String,
        message: String,
        result: Map<String, Value>,
    },
}

impl PipelineOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            step_name: None,
            error: error.into(),
        }
    }

    pub fn failed_step(step_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Failed {
            step_name: Some(step_name.into()),
            error: error.into(),
        }
    }

    /// The job status this outcome maps to.
    pub fn job_status(&self) -> JobStatus {
        match self {
            Self::Completed { .. } => JobStatus::Completed,
            Self::Failed { .. } => JobStatus::Failed,
            Self::Terminated { .. } => JobStatus::Terminated,
        }
    }
}
