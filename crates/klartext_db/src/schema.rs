//! Schema bootstrap for the Klartext state store.
//!
//! Idempotent CREATE TABLE IF NOT EXISTS statements run at startup; the
//! same function backs the in-memory test fixtures so tests and
//! production share one schema.

use sqlx::{Pool, Sqlite};

use crate::error::Result;

const SCHEMA: &[&str] = &[
    // Jobs: one row per document processing request. file_content holds
    // an opaque ciphertext envelope, never plaintext.
    r#"
    CREATE TABLE IF NOT EXISTS kx_jobs (
        id INTEGER PRIMARY KEY,
        processing_id TEXT NOT NULL UNIQUE,
        filename TEXT NOT NULL,
        mime_type TEXT NOT NULL,
        file_content BLOB NOT NULL,
        status TEXT NOT NULL DEFAULT 'PENDING',
        progress_percent INTEGER NOT NULL DEFAULT 0,
        processing_options TEXT NOT NULL DEFAULT '{}',
        result_data TEXT,
        error_message TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_kx_jobs_status ON kx_jobs (status)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS kx_document_classes (
        class_key TEXT PRIMARY KEY,
        display_name TEXT NOT NULL,
        is_enabled INTEGER NOT NULL DEFAULT 1,
        is_system_class INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS kx_model_specs (
        id INTEGER PRIMARY KEY,
        provider TEXT NOT NULL,
        name TEXT NOT NULL,
        display_name TEXT NOT NULL,
        max_tokens INTEGER NOT NULL DEFAULT 4096,
        supports_vision INTEGER NOT NULL DEFAULT 0,
        is_enabled INTEGER NOT NULL DEFAULT 1,
        price_input_per_1m_tokens REAL,
        price_output_per_1m_tokens REAL
    )
    "#,
    // Pipeline step configuration. step_order is a total order within a
    // phase; document_class_key partitions class-specific steps.
    r#"
    CREATE TABLE IF NOT EXISTS kx_pipeline_steps (
        id INTEGER PRIMARY KEY,
        step_order INTEGER NOT NULL,
        name TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        prompt_template TEXT NOT NULL,
        system_prompt TEXT,
        model_id INTEGER NOT NULL REFERENCES kx_model_specs (id),
        temperature REAL NOT NULL DEFAULT 0.2,
        max_tokens INTEGER,
        retry_on_failure INTEGER NOT NULL DEFAULT 1,
        max_retries INTEGER NOT NULL DEFAULT 2,
        output_format TEXT NOT NULL DEFAULT 'text',
        document_class_key TEXT REFERENCES kx_document_classes (class_key),
        is_branching_step INTEGER NOT NULL DEFAULT 0,
        branching_field TEXT,
        post_branching INTEGER NOT NULL DEFAULT 0,
        source_language TEXT,
        required_context_variables TEXT NOT NULL DEFAULT '[]',
        stop_conditions TEXT
    )
    "#,
    // Step executions: one row per attempted invocation. input_text and
    // output_text are ciphertext envelopes.
    r#"
    CREATE TABLE IF NOT EXISTS kx_step_executions (
        id INTEGER PRIMARY KEY,
        job_id INTEGER NOT NULL REFERENCES kx_jobs (id),
        step_name TEXT NOT NULL,
        step_order INTEGER NOT NULL,
        attempt INTEGER NOT NULL,
        input_text BLOB,
        output_text BLOB,
        status TEXT NOT NULL DEFAULT 'PENDING',
        started_at TEXT,
        finished_at TEXT,
        error_message TEXT
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_kx_step_exec_attempt
        ON kx_step_executions (job_id, step_order, attempt)
    "#,
    // Cost ledger: append-only. The only DELETE against this table is
    // the retention prune.
    r#"
    CREATE TABLE IF NOT EXISTS kx_cost_ledger (
        id INTEGER PRIMARY KEY,
        job_id INTEGER NOT NULL REFERENCES kx_jobs (id),
        step_name TEXT NOT NULL,
        input_tokens INTEGER NOT NULL,
        output_tokens INTEGER NOT NULL,
        total_tokens INTEGER NOT NULL,
        input_cost_usd REAL NOT NULL,
        output_cost_usd REAL NOT NULL,
        total_cost_usd REAL NOT NULL,
        model_provider TEXT NOT NULL,
        model_name TEXT NOT NULL,
        processing_time_seconds REAL NOT NULL,
        document_type TEXT,
        metadata TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_kx_cost_ledger_job ON kx_cost_ledger (job_id)
    "#,
    // Broker task queue: at-least-once delivery with atomic claim and
    // heartbeat-based redelivery.
    r#"
    CREATE TABLE IF NOT EXISTS kx_task_queue (
        id INTEGER PRIMARY KEY,
        processing_id TEXT NOT NULL,
        options TEXT NOT NULL DEFAULT '{}',
        status TEXT NOT NULL DEFAULT 'QUEUED',
        priority INTEGER NOT NULL DEFAULT 0,
        enqueued_at TEXT NOT NULL,
        claim_time TEXT,
        worker_id TEXT,
        last_heartbeat TEXT,
        result_payload TEXT,
        result_expires_at TEXT
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_kx_task_queue_status
        ON kx_task_queue (status, priority, id)
    "#,
];

/// Install or upgrade the schema.
pub async fn migrate(pool: &Pool<Sqlite>) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
