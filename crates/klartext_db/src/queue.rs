//! Broker task queue.
//!
//! A SQLite-backed queue with at-least-once delivery: claiming is an
//! atomic UPDATE ... WHERE status = 'QUEUED' inside a transaction, a
//! claimed task is kept alive by worker heartbeats, and tasks whose
//! heartbeat goes stale are returned to QUEUED for redelivery. Duplicate
//! suppression happens at pickup, by job status, not here.

use chrono::{Duration, Utc};
use sqlx::{Pool, Sqlite};
use tracing::info;

use klartext_protocol::ProcessingOptions;

use crate::error::Result;
use crate::models::QueueTask;

pub struct TaskQueue {
    pool: Pool<Sqlite>,
}

impl TaskQueue {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Publish a task. Idempotent per `processing_id`: if an active
    /// (QUEUED or RUNNING) task already exists, its id is returned and
    /// no new row is inserted.
    pub async fn enqueue(
        &self,
        processing_id: &str,
        options: &ProcessingOptions,
        priority: i64,
    ) -> Result<i64> {
        let existing: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM kx_task_queue
            WHERE processing_id = ? AND status IN ('QUEUED', 'RUNNING')
            ORDER BY id ASC
            LIMIT 1
            "#,
        )
        .bind(processing_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = existing {
            info!(%processing_id, task_id = id, "Duplicate enqueue suppressed");
            return Ok(id);
        }

        let id = sqlx::query(
            r#"
            INSERT INTO kx_task_queue (processing_id, options, status, priority, enqueued_at)
            VALUES (?, ?, 'QUEUED', ?, ?)
            "#,
        )
        .bind(processing_id)
        .bind(options.to_json())
        .bind(priority)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        info!(%processing_id, task_id = id, "Task enqueued");
        Ok(id)
    }

    /// Atomically pop the next task.
    ///
    /// Claims the highest-priority QUEUED row (FIFO within a priority)
    /// via UPDATE ... WHERE status = 'QUEUED'; a concurrent claim simply
    /// yields None.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<QueueTask>> {
        let mut tx = self.pool.begin().await?;

        let task_id: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM kx_task_queue
            WHERE status = 'QUEUED'
            ORDER BY priority DESC, id ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(task_id) = task_id else {
            tx.commit().await?;
            return Ok(None);
        };

        let now = Utc::now();
        let rows_affected = sqlx::query(
            r#"
            UPDATE kx_task_queue
            SET status = 'RUNNING',
                claim_time = ?,
                worker_id = ?,
                last_heartbeat = ?
            WHERE id = ? AND status = 'QUEUED'
            "#,
        )
        .bind(now)
        .bind(worker_id)
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // Claimed by another worker in the meantime.
            tx.commit().await?;
            return Ok(None);
        }

        let task: QueueTask = sqlx::query_as("SELECT * FROM kx_task_queue WHERE id = ?")
            .bind(task_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(task_id, processing_id = %task.processing_id, worker_id, "Claimed task");
        Ok(Some(task))
    }

    /// Re-assert ownership of a claimed task.
    pub async fn heartbeat(&self, task_id: i64) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE kx_task_queue
            SET last_heartbeat = ?
            WHERE id = ? AND status = 'RUNNING'
            "#,
        )
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    /// Acknowledge a delivered task, optionally storing a result payload
    /// with a TTL for the result backend.
    pub async fn ack(&self, task_id: i64, result: Option<&str>, ttl_secs: u64) -> Result<()> {
        let expires = result.map(|_| Utc::now() + Duration::seconds(ttl_secs as i64));
        sqlx::query(
            r#"
            UPDATE kx_task_queue
            SET status = 'ACKED',
                result_payload = ?,
                result_expires_at = ?
            WHERE id = ?
            "#,
        )
        .bind(result)
        .bind(expires)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cancel a still-QUEUED task for a processing id; a RUNNING task is
    /// left to the cooperative in-worker cancellation.
    pub async fn cancel_queued(&self, processing_id: &str) -> Result<bool> {
        let affected = sqlx::query(
            r#"
            UPDATE kx_task_queue
            SET status = 'CANCELLED'
            WHERE processing_id = ? AND status = 'QUEUED'
            "#,
        )
        .bind(processing_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    /// Return tasks whose worker stopped heartbeating to QUEUED for
    /// redelivery. Lost workers release their tasks this way.
    pub async fn requeue_stale(&self, stale_secs: u64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::seconds(stale_secs as i64);
        let requeued = sqlx::query(
            r#"
            UPDATE kx_task_queue
            SET status = 'QUEUED',
                claim_time = NULL,
                worker_id = NULL,
                last_heartbeat = NULL
            WHERE status = 'RUNNING' AND last_heartbeat < ?
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if requeued > 0 {
            info!(requeued, "Requeued stale tasks for redelivery");
        }
        Ok(requeued)
    }

    /// Drop result payloads past their TTL.
    pub async fn expire_results(&self) -> Result<u64> {
        let expired = sqlx::query(
            r#"
            UPDATE kx_task_queue
            SET result_payload = NULL, result_expires_at = NULL
            WHERE result_payload IS NOT NULL AND result_expires_at < ?
            "#,
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(expired)
    }

    /// Get queue statistics.
    pub async fn stats(&self) -> Result<QueueStats> {
        let stats: QueueStats = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'QUEUED') AS queued,
                COUNT(*) FILTER (WHERE status = 'RUNNING') AS running,
                COUNT(*) FILTER (WHERE status = 'ACKED') AS acked,
                COUNT(*) FILTER (WHERE status = 'CANCELLED') AS cancelled
            FROM kx_task_queue
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct QueueStats {
    pub queued: i64,
    pub running: i64,
    pub acked: i64,
    pub cancelled: i64,
}
