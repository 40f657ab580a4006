//! Database models for the Klartext state store.
//!
//! Row structs (`*Row`, derive `FromRow`) mirror the storage encoding;
//! the public value types carry decrypted sensitive fields and parsed
//! JSON columns. Every value returned by a store is detached plain data:
//! there is no session handle that could flush it back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;

use klartext_protocol::{JobStatus, OutputFormat, ProcessingOptions, StepStatus, StopConditions, TaskStatus};

use crate::error::{DbError, Result};

// ============================================================================
// Jobs
// ============================================================================

/// Storage encoding of a job row. `file_content` is ciphertext.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: i64,
    pub processing_id: String,
    pub filename: String,
    pub mime_type: String,
    pub file_content: Vec<u8>,
    pub status: JobStatus,
    pub progress_percent: i64,
    pub processing_options: String,
    pub result_data: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A document processing job, detached from the store.
///
/// `file_content` holds the decrypted document bytes; the value lives in
/// worker-local memory only and is never written back wholesale.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub processing_id: String,
    pub filename: String,
    pub mime_type: String,
    pub file_content: Vec<u8>,
    pub status: JobStatus,
    pub progress_percent: i64,
    pub processing_options: ProcessingOptions,
    pub result_data: Map<String, Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub(crate) fn from_row(row: JobRow, cipher: &klartext_crypto::FieldCipher) -> Result<Self> {
        let file_content = cipher.decrypt(&row.file_content)?;
        let result_data = match row.result_data.as_deref() {
            Some(raw) => serde_json::from_str(raw)?,
            None => Map::new(),
        };
        Ok(Self {
            id: row.id,
            processing_id: row.processing_id,
            filename: row.filename,
            mime_type: row.mime_type,
            file_content,
            status: row.status,
            progress_percent: row.progress_percent,
            processing_options: ProcessingOptions::from_json(&row.processing_options),
            result_data,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Fields of a job at creation time. `file_content` is plaintext here
/// and encrypted by the store before insert.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub processing_id: String,
    pub filename: String,
    pub mime_type: String,
    pub file_content: Vec<u8>,
    pub processing_options: ProcessingOptions,
}

/// Surgical update: only the fields set here reach the UPDATE statement;
/// no other column is rewritten as a side effect.
#[derive(Debug, Clone, Default)]
pub struct UpdateJob {
    pub status: Option<JobStatus>,
    pub error_message: Option<Option<String>>,
    pub result_data: Option<Map<String, Value>>,
    /// Plaintext; re-encrypted by the store.
    pub file_content: Option<Vec<u8>>,
}

impl UpdateJob {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.error_message.is_none()
            && self.result_data.is_none()
            && self.file_content.is_none()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(Some(message.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error_message = Some(None);
        self
    }

    pub fn result_data(mut self, data: Map<String, Value>) -> Self {
        self.result_data = Some(data);
        self
    }

    pub fn file_content(mut self, plaintext: Vec<u8>) -> Self {
        self.file_content = Some(plaintext);
        self
    }
}

// ============================================================================
// Pipeline configuration
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct PipelineStepRow {
    pub id: i64,
    pub step_order: i64,
    pub name: String,
    pub enabled: bool,
    pub prompt_template: String,
    pub system_prompt: Option<String>,
    pub model_id: i64,
    pub temperature: f64,
    pub max_tokens: Option<i64>,
    pub retry_on_failure: bool,
    pub max_retries: i64,
    pub output_format: OutputFormat,
    pub document_class_key: Option<String>,
    pub is_branching_step: bool,
    pub branching_field: Option<String>,
    pub post_branching: bool,
    pub source_language: Option<String>,
    pub required_context_variables: String,
    pub stop_conditions: Option<String>,
}

/// Declarative description of one AI stage, with JSON columns parsed.
#[derive(Debug, Clone)]
pub struct PipelineStep {
    pub id: i64,
    pub order: i64,
    pub name: String,
    pub enabled: bool,
    pub prompt_template: String,
    pub system_prompt: Option<String>,
    pub model_id: i64,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
    pub retry_on_failure: bool,
    pub max_retries: u32,
    pub output_format: OutputFormat,
    pub document_class_key: Option<String>,
    pub is_branching_step: bool,
    pub branching_field: Option<String>,
    pub post_branching: bool,
    pub source_language: Option<String>,
    pub required_context_variables: Vec<String>,
    pub stop_conditions: Option<StopConditions>,
}

impl TryFrom<PipelineStepRow> for PipelineStep {
    type Error = DbError;

    fn try_from(row: PipelineStepRow) -> Result<Self> {
        let required_context_variables: Vec<String> =
            serde_json::from_str(&row.required_context_variables)?;
        let stop_conditions = row
            .stop_conditions
            .as_deref()
            .map(serde_json::from_str::<StopConditions>)
            .transpose()?;
        Ok(Self {
            id: row.id,
            order: row.step_order,
            name: row.name,
            enabled: row.enabled,
            prompt_template: row.prompt_template,
            system_prompt: row.system_prompt,
            model_id: row.model_id,
            temperature: row.temperature,
            max_tokens: row.max_tokens.map(|v| v as u32),
            retry_on_failure: row.retry_on_failure,
            max_retries: row.max_retries.clamp(0, 10) as u32,
            output_format: row.output_format,
            document_class_key: row.document_class_key,
            is_branching_step: row.is_branching_step,
            branching_field: row.branching_field,
            post_branching: row.post_branching,
            source_language: row.source_language,
            required_context_variables,
            stop_conditions,
        })
    }
}

/// A classification bucket for documents.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DocumentClass {
    pub class_key: String,
    pub display_name: String,
    pub is_enabled: bool,
    pub is_system_class: bool,
}

/// An LLM endpoint description, including the pricing snapshot used by
/// the cost ledger.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: i64,
    pub provider: String,
    pub name: String,
    pub display_name: String,
    pub max_tokens: i64,
    pub supports_vision: bool,
    pub is_enabled: bool,
    pub price_input_per_1m_tokens: Option<f64>,
    pub price_output_per_1m_tokens: Option<f64>,
}

// ============================================================================
// Step executions
// ============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct StepExecutionRow {
    pub id: i64,
    pub job_id: i64,
    pub step_name: String,
    pub step_order: i64,
    pub attempt: i64,
    pub input_text: Option<Vec<u8>>,
    pub output_text: Option<Vec<u8>>,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// One attempted invocation of one step, decrypted for audit views.
#[derive(Debug, Clone)]
pub struct StepExecution {
    pub id: i64,
    pub job_id: i64,
    pub step_name: String,
    pub step_order: i64,
    pub attempt: i64,
    pub input_text: Option<String>,
    pub output_text: Option<String>,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl StepExecution {
    pub(crate) fn from_row(
        row: StepExecutionRow,
        cipher: &klartext_crypto::FieldCipher,
    ) -> Result<Self> {
        let input_text = row
            .input_text
            .as_deref()
            .map(|c| cipher.decrypt_str(c))
            .transpose()?;
        let output_text = row
            .output_text
            .as_deref()
            .map(|c| cipher.decrypt_str(c))
            .transpose()?;
        Ok(Self {
            id: row.id,
            job_id: row.job_id,
            step_name: row.step_name,
            step_order: row.step_order,
            attempt: row.attempt,
            input_text,
            output_text,
            status: row.status,
            started_at: row.started_at,
            finished_at: row.finished_at,
            error_message: row.error_message,
        })
    }
}

/// Fields of a step execution at record time; texts are plaintext here
/// and encrypted by the store.
#[derive(Debug, Clone)]
pub struct NewStepExecution {
    pub job_id: i64,
    pub step_name: String,
    pub step_order: i64,
    pub attempt: i64,
    pub input_text: Option<String>,
    pub output_text: Option<String>,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

// ============================================================================
// Cost ledger
// ============================================================================

/// Immutable accounting record for one LLM call.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CostLedgerEntry {
    pub id: i64,
    pub job_id: i64,
    pub step_name: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub input_cost_usd: f64,
    pub output_cost_usd: f64,
    pub total_cost_usd: f64,
    pub model_provider: String,
    pub model_name: String,
    pub processing_time_seconds: f64,
    pub document_type: Option<String>,
    pub metadata: String,
    pub created_at: DateTime<Utc>,
}

/// Input to [`CostLedger::log`](crate::ledger::CostLedger::log); cost is
/// computed from the pricing snapshot at insert time.
#[derive(Debug, Clone)]
pub struct NewCostEntry {
    pub job_id: i64,
    pub step_name: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub model_provider: String,
    pub model_name: String,
    pub price_input_per_1m_tokens: Option<f64>,
    pub price_output_per_1m_tokens: Option<f64>,
    pub processing_time_seconds: f64,
    pub document_type: Option<String>,
    pub metadata: Map<String, Value>,
}

// ============================================================================
// Task queue
// ============================================================================

/// One broker task row.
#[derive(Debug, Clone, FromRow)]
pub struct QueueTask {
    pub id: i64,
    pub processing_id: String,
    pub options: String,
    pub status: TaskStatus,
    pub priority: i64,
    pub enqueued_at: DateTime<Utc>,
    pub claim_time: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub result_payload: Option<String>,
    pub result_expires_at: Option<DateTime<Utc>>,
}

impl QueueTask {
    /// Parse the options column into the recognized keys.
    pub fn processing_options(&self) -> ProcessingOptions {
        ProcessingOptions::from_json(&self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_job_builder_tracks_presence() {
        let update = UpdateJob::default();
        assert!(update.is_empty());

        let update = UpdateJob::default()
            .status(JobStatus::Failed)
            .error_message("boom");
        assert!(!update.is_empty());
        assert_eq!(update.status, Some(JobStatus::Failed));
        assert_eq!(update.error_message, Some(Some("boom".to_string())));
        assert!(update.result_data.is_none());
    }

    #[test]
    fn step_row_parsing_rejects_bad_json() {
        let row = PipelineStepRow {
            id: 1,
            step_order: 1,
            name: "classify".into(),
            enabled: true,
            prompt_template: "{input_text}".into(),
            system_prompt: None,
            model_id: 1,
            temperature: 0.0,
            max_tokens: None,
            retry_on_failure: true,
            max_retries: 2,
            output_format: OutputFormat::Json,
            document_class_key: None,
            is_branching_step: true,
            branching_field: Some("document_type".into()),
            post_branching: false,
            source_language: None,
            required_context_variables: "not-json".into(),
            stop_conditions: None,
        };
        assert!(PipelineStep::try_from(row).is_err());
    }
}
