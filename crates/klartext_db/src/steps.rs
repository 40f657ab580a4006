//! Step execution store.
//!
//! One row per attempted invocation, `(job_id, step_order, attempt)`
//! unique. Input and output text are encrypted before insert and only
//! decrypted for audit reads.

use std::sync::Arc;

use sqlx::{Pool, Sqlite};

use klartext_crypto::FieldCipher;

use crate::error::{DbError, Result};
use crate::models::{NewStepExecution, StepExecution, StepExecutionRow};

pub struct StepExecutionStore {
    pool: Pool<Sqlite>,
    cipher: Arc<FieldCipher>,
}

impl StepExecutionStore {
    pub fn new(pool: Pool<Sqlite>, cipher: Arc<FieldCipher>) -> Self {
        Self { pool, cipher }
    }

    /// Insert one attempt row, encrypting the step I/O.
    pub async fn record(&self, new: NewStepExecution) -> Result<i64> {
        let input_ciphertext = new
            .input_text
            .as_deref()
            .map(|t| self.cipher.encrypt_str(t))
            .transpose()?;
        let output_ciphertext = new
            .output_text
            .as_deref()
            .map(|t| self.cipher.encrypt_str(t))
            .transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO kx_step_executions
                (job_id, step_name, step_order, attempt, input_text, output_text,
                 status, started_at, finished_at, error_message)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(new.job_id)
        .bind(&new.step_name)
        .bind(new.step_order)
        .bind(new.attempt)
        .bind(&input_ciphertext)
        .bind(&output_ciphertext)
        .bind(new.status)
        .bind(new.started_at)
        .bind(new.finished_at)
        .bind(&new.error_message)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.last_insert_rowid()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(DbError::constraint(format!(
                    "duplicate attempt {} for job {} step {}",
                    new.attempt, new.job_id, new.step_order
                )))
            }
            Err(other) => Err(other.into()),
        }
    }

    /// All attempts for a job, decrypted, in insertion order.
    pub async fn for_job(&self, job_id: i64) -> Result<Vec<StepExecution>> {
        let rows: Vec<StepExecutionRow> = sqlx::query_as(
            r#"
            SELECT * FROM kx_step_executions
            WHERE job_id = ?
            ORDER BY step_order ASC, attempt ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| StepExecution::from_row(row, &self.cipher))
            .collect()
    }

    /// Attempts for one step of a job, in attempt order.
    pub async fn attempts_for_step(&self, job_id: i64, step_order: i64) -> Result<Vec<StepExecution>> {
        let rows: Vec<StepExecutionRow> = sqlx::query_as(
            r#"
            SELECT * FROM kx_step_executions
            WHERE job_id = ? AND step_order = ?
            ORDER BY attempt ASC
            "#,
        )
        .bind(job_id)
        .bind(step_order)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| StepExecution::from_row(row, &self.cipher))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewJob;
    use crate::Database;
    use chrono::Utc;
    use klartext_protocol::{ProcessingOptions, StepStatus};

    async fn setup() -> (Database, i64) {
        let cipher = FieldCipher::from_key_bytes(&[3u8; 32]);
        let db = Database::open_in_memory(cipher).await.unwrap();
        let job = db
            .jobs()
            .create(NewJob {
                processing_id: "p-steps".into(),
                filename: "doc.txt".into(),
                mime_type: "text/plain".into(),
                file_content: b"text".to_vec(),
                processing_options: ProcessingOptions::default(),
            })
            .await
            .unwrap();
        (db, job.id)
    }

    fn attempt(job_id: i64, order: i64, n: i64, status: StepStatus) -> NewStepExecution {
        NewStepExecution {
            job_id,
            step_name: "classify".into(),
            step_order: order,
            attempt: n,
            input_text: Some("scrubbed input".into()),
            output_text: (status == StepStatus::Completed).then(|| "output".to_string()),
            status,
            started_at: Some(Utc::now()),
            finished_at: Some(Utc::now()),
            error_message: None,
        }
    }

    #[tokio::test]
    async fn io_round_trips_through_encryption() {
        let (db, job_id) = setup().await;
        db.steps()
            .record(attempt(job_id, 1, 1, StepStatus::Completed))
            .await
            .unwrap();

        // Stored bytes must be ciphertext.
        let raw: Vec<u8> =
            sqlx::query_scalar("SELECT input_text FROM kx_step_executions WHERE job_id = ?")
                .bind(job_id)
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert!(!raw.windows(8).any(|w| w == b"scrubbed"));

        let executions = db.steps().for_job(job_id).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].input_text.as_deref(), Some("scrubbed input"));
        assert_eq!(executions[0].output_text.as_deref(), Some("output"));
    }

    #[tokio::test]
    async fn duplicate_attempt_rejected() {
        let (db, job_id) = setup().await;
        db.steps()
            .record(attempt(job_id, 1, 1, StepStatus::Failed))
            .await
            .unwrap();
        let dup = db
            .steps()
            .record(attempt(job_id, 1, 1, StepStatus::Completed))
            .await;
        assert!(matches!(dup, Err(DbError::Constraint(_))));

        // A new attempt number is fine.
        db.steps()
            .record(attempt(job_id, 1, 2, StepStatus::Completed))
            .await
            .unwrap();
        let attempts = db.steps().attempts_for_step(job_id, 1).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].attempt, 2);
    }
}
