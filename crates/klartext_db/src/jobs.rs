//! Job store.
//!
//! Three layered defenses keep sensitive bytes off the write path:
//! loads decrypt into detached values (no session to flush), updates are
//! column-targeted (only the named fields reach the UPDATE), and any
//! post-update value handed back is freshly reloaded. `file_content` is
//! written exactly once, at creation.

use std::sync::Arc;

use chrono::{Duration, Utc};
use sqlx::{Pool, QueryBuilder, Sqlite};
use tracing::{error, info};

use klartext_crypto::FieldCipher;
use klartext_protocol::defaults::ERROR_ORPHANED;
use klartext_protocol::JobStatus;

use crate::error::{DbError, Result};
use crate::models::{Job, JobRow, NewJob, UpdateJob};

pub struct JobStore {
    pool: Pool<Sqlite>,
    cipher: Arc<FieldCipher>,
}

impl JobStore {
    pub fn new(pool: Pool<Sqlite>, cipher: Arc<FieldCipher>) -> Self {
        Self { pool, cipher }
    }

    /// Insert a new job with status PENDING, encrypting the document
    /// bytes, and return the freshly loaded (detached) value.
    pub async fn create(&self, new: NewJob) -> Result<Job> {
        let now = Utc::now();
        let ciphertext = self.cipher.encrypt(&new.file_content)?;
        let options = new.processing_options.to_json();

        let id = sqlx::query(
            r#"
            INSERT INTO kx_jobs
                (processing_id, filename, mime_type, file_content, status,
                 progress_percent, processing_options, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'PENDING', 0, ?, ?, ?)
            "#,
        )
        .bind(&new.processing_id)
        .bind(&new.filename)
        .bind(&new.mime_type)
        .bind(&ciphertext)
        .bind(&options)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        info!(job_id = id, processing_id = %new.processing_id, "Created job");
        self.get(id).await
    }

    /// Load a job by primary key; the returned value is detached and
    /// carries the decrypted document bytes.
    pub async fn get(&self, id: i64) -> Result<Job> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM kx_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let row = row.ok_or_else(|| DbError::not_found(format!("job {id}")))?;
        Job::from_row(row, &self.cipher)
    }

    /// Load a job by its externally visible processing id.
    pub async fn get_by_processing_id(&self, processing_id: &str) -> Result<Job> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM kx_jobs WHERE processing_id = ?")
            .bind(processing_id)
            .fetch_optional(&self.pool)
            .await?;
        let row = row.ok_or_else(|| DbError::not_found(format!("job {processing_id}")))?;
        Job::from_row(row, &self.cipher)
    }

    /// Raw ciphertext of the document column, for audit verification.
    pub async fn file_ciphertext(&self, id: i64) -> Result<Vec<u8>> {
        let raw: Option<Vec<u8>> = sqlx::query_scalar("SELECT file_content FROM kx_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        raw.ok_or_else(|| DbError::not_found(format!("job {id}")))
    }

    /// Surgical update: writes exactly the columns present in `update`
    /// (plus `updated_at`), keyed by primary key. Sensitive fields are
    /// re-encrypted before the write.
    pub async fn update(&self, id: i64, update: UpdateJob) -> Result<()> {
        if update.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE kx_jobs SET ");

        if let Some(status) = update.status {
            builder.push("status = ");
            builder.push_bind(status);
            builder.push(", ");
        }
        if let Some(error_message) = update.error_message {
            builder.push("error_message = ");
            builder.push_bind(error_message);
            builder.push(", ");
        }
        if let Some(result_data) = update.result_data {
            let raw = serde_json::to_string(&result_data)?;
            builder.push("result_data = ");
            builder.push_bind(raw);
            builder.push(", ");
        }
        if let Some(plaintext) = update.file_content {
            let ciphertext = self.cipher.encrypt(&plaintext)?;
            builder.push("file_content = ");
            builder.push_bind(ciphertext);
            builder.push(", ");
        }
        builder.push("updated_at = ");
        builder.push_bind(Utc::now());
        builder.push(" WHERE id = ");
        builder.push_bind(id);

        let affected = builder.build().execute(&self.pool).await?.rows_affected();
        if affected == 0 {
            return Err(DbError::not_found(format!("job {id}")));
        }
        Ok(())
    }

    /// QUEUED dispatch transition; returns false if the job was not
    /// PENDING (already dispatched or beyond).
    pub async fn mark_queued(&self, processing_id: &str) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE kx_jobs
            SET status = 'QUEUED', updated_at = ?
            WHERE processing_id = ? AND status = 'PENDING'
            "#,
        )
        .bind(Utc::now())
        .bind(processing_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    /// Worker-pickup transition. Returns false if the job is not
    /// claimable (already RUNNING or terminal): the caller drops the
    /// duplicate delivery.
    pub async fn mark_running(&self, processing_id: &str) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE kx_jobs
            SET status = 'RUNNING', updated_at = ?
            WHERE processing_id = ? AND status IN ('PENDING', 'QUEUED')
            "#,
        )
        .bind(Utc::now())
        .bind(processing_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    /// Monotone progress write: a stale (lower) percentage is discarded.
    /// Returns whether the write took effect.
    pub async fn advance_progress(&self, id: i64, percent: i64) -> Result<bool> {
        let percent = percent.clamp(0, 100);
        let affected = sqlx::query(
            r#"
            UPDATE kx_jobs
            SET progress_percent = ?, updated_at = ?
            WHERE id = ?
              AND progress_percent <= ?
              AND status NOT IN ('COMPLETED', 'FAILED', 'TERMINATED')
            "#,
        )
        .bind(percent)
        .bind(Utc::now())
        .bind(id)
        .bind(percent)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    /// Transition into a terminal state. Guarded so terminal states are
    /// absorbing; returns false if the job already reached one.
    pub async fn finish(
        &self,
        id: i64,
        status: JobStatus,
        error_message: Option<&str>,
        result_data: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(DbError::invalid_state(format!(
                "finish() requires a terminal status, got {status}"
            )));
        }
        let result_raw = result_data.map(serde_json::to_string).transpose()?;

        let affected = sqlx::query(
            r#"
            UPDATE kx_jobs
            SET status = ?,
                error_message = ?,
                result_data = COALESCE(?, result_data),
                progress_percent = CASE WHEN ? = 'COMPLETED' THEN 100 ELSE progress_percent END,
                updated_at = ?
            WHERE id = ? AND status NOT IN ('COMPLETED', 'FAILED', 'TERMINATED')
            "#,
        )
        .bind(status)
        .bind(error_message)
        .bind(result_raw)
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected > 0 {
            info!(job_id = id, status = %status, "Job finished");
        }
        Ok(affected > 0)
    }

    /// Fail a job whose row cannot be processed (e.g. its ciphertext no
    /// longer decrypts), without loading it. Guarded like `finish`.
    pub async fn fail_by_processing_id(
        &self,
        processing_id: &str,
        error_message: &str,
    ) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE kx_jobs
            SET status = 'FAILED', error_message = ?, updated_at = ?
            WHERE processing_id = ? AND status NOT IN ('COMPLETED', 'FAILED', 'TERMINATED')
            "#,
        )
        .bind(error_message)
        .bind(Utc::now())
        .bind(processing_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    /// Fail RUNNING jobs with no activity for `stale_secs`. Returns the
    /// processing ids of the jobs transitioned.
    pub async fn fail_orphaned(&self, stale_secs: u64) -> Result<Vec<String>> {
        let cutoff = Utc::now() - Duration::seconds(stale_secs as i64);
        let orphaned: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT processing_id FROM kx_jobs
            WHERE status = 'RUNNING' AND updated_at < ?
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        for processing_id in &orphaned {
            let affected = sqlx::query(
                r#"
                UPDATE kx_jobs
                SET status = 'FAILED', error_message = ?, updated_at = ?
                WHERE processing_id = ? AND status = 'RUNNING'
                "#,
            )
            .bind(ERROR_ORPHANED)
            .bind(Utc::now())
            .bind(processing_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
            if affected > 0 {
                error!(%processing_id, "Job orphaned: no worker activity, marked FAILED");
            }
        }
        Ok(orphaned)
    }

    /// Delete a job and its step executions.
    pub async fn delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM kx_step_executions WHERE job_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        let affected = sqlx::query("DELETE FROM kx_jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(DbError::not_found(format!("job {id}")));
        }
        Ok(())
    }

    /// Retention purge: delete jobs (and their step executions) older
    /// than the window. The cost ledger is pruned separately on its own
    /// longer window.
    pub async fn purge_older_than(&self, days: u32) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(days as i64);
        sqlx::query(
            r#"
            DELETE FROM kx_step_executions
            WHERE job_id IN (SELECT id FROM kx_jobs WHERE created_at < ?)
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        let purged = sqlx::query("DELETE FROM kx_jobs WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if purged > 0 {
            info!(purged, "Retention purge removed old jobs");
        }
        Ok(purged)
    }
}
