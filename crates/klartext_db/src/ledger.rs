//! Cost & audit ledger.
//!
//! Append-only accounting of LLM usage: one row per provider call with
//! the token counts the provider reported and cost computed from the
//! pricing snapshot at call time. No update path exists; the only DELETE
//! is the retention prune. Callers must treat write failures as
//! non-fatal: the ledger is never on the correctness-critical path.

use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, Pool, Sqlite};
use tracing::warn;

use crate::error::Result;
use crate::models::{CostLedgerEntry, NewCostEntry};

pub struct CostLedger {
    pool: Pool<Sqlite>,
}

/// Aggregate over a time window.
#[derive(Debug, Clone, FromRow)]
pub struct LedgerTotals {
    pub entries: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub total_cost_usd: f64,
}

/// Per-model aggregate.
#[derive(Debug, Clone, FromRow)]
pub struct ModelBreakdown {
    pub model_provider: String,
    pub model_name: String,
    pub entries: i64,
    pub total_tokens: i64,
    pub total_cost_usd: f64,
}

/// Per-step aggregate.
#[derive(Debug, Clone, FromRow)]
pub struct StepBreakdown {
    pub step_name: String,
    pub entries: i64,
    pub total_tokens: i64,
    pub total_cost_usd: f64,
}

impl CostLedger {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Insert one accounting row. Cost is
    /// `tokens * price_per_1m / 1_000_000`; absent pricing logs zero
    /// cost with a warning rather than failing the call.
    pub async fn log(&self, entry: NewCostEntry) -> Result<i64> {
        if entry.price_input_per_1m_tokens.is_none() || entry.price_output_per_1m_tokens.is_none() {
            warn!(
                model = %entry.model_name,
                step = %entry.step_name,
                "No pricing configured for model; logging zero cost"
            );
        }
        let input_cost =
            entry.input_tokens as f64 * entry.price_input_per_1m_tokens.unwrap_or(0.0) / 1_000_000.0;
        let output_cost = entry.output_tokens as f64
            * entry.price_output_per_1m_tokens.unwrap_or(0.0)
            / 1_000_000.0;
        let metadata = serde_json::to_string(&entry.metadata)?;

        let id = sqlx::query(
            r#"
            INSERT INTO kx_cost_ledger
                (job_id, step_name, input_tokens, output_tokens, total_tokens,
                 input_cost_usd, output_cost_usd, total_cost_usd,
                 model_provider, model_name, processing_time_seconds,
                 document_type, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.job_id)
        .bind(&entry.step_name)
        .bind(entry.input_tokens)
        .bind(entry.output_tokens)
        .bind(entry.input_tokens + entry.output_tokens)
        .bind(input_cost)
        .bind(output_cost)
        .bind(input_cost + output_cost)
        .bind(&entry.model_provider)
        .bind(&entry.model_name)
        .bind(entry.processing_time_seconds)
        .bind(&entry.document_type)
        .bind(&metadata)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(id)
    }

    /// Totals over `[from, to)`.
    pub async fn total_in_window(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<LedgerTotals> {
        let totals: LedgerTotals = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) AS entries,
                COALESCE(SUM(input_tokens), 0) AS input_tokens,
                COALESCE(SUM(output_tokens), 0) AS output_tokens,
                COALESCE(SUM(total_tokens), 0) AS total_tokens,
                COALESCE(SUM(total_cost_usd), 0.0) AS total_cost_usd
            FROM kx_cost_ledger
            WHERE created_at >= ? AND created_at < ?
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?;
        Ok(totals)
    }

    /// Aggregate by model, most expensive first.
    pub async fn by_model(&self) -> Result<Vec<ModelBreakdown>> {
        let rows: Vec<ModelBreakdown> = sqlx::query_as(
            r#"
            SELECT
                model_provider,
                model_name,
                COUNT(*) AS entries,
                COALESCE(SUM(total_tokens), 0) AS total_tokens,
                COALESCE(SUM(total_cost_usd), 0.0) AS total_cost_usd
            FROM kx_cost_ledger
            GROUP BY model_provider, model_name
            ORDER BY total_cost_usd DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Aggregate by step name, most expensive first.
    pub async fn by_step(&self) -> Result<Vec<StepBreakdown>> {
        let rows: Vec<StepBreakdown> = sqlx::query_as(
            r#"
            SELECT
                step_name,
                COUNT(*) AS entries,
                COALESCE(SUM(total_tokens), 0) AS total_tokens,
                COALESCE(SUM(total_cost_usd), 0.0) AS total_cost_usd
            FROM kx_cost_ledger
            GROUP BY step_name
            ORDER BY total_cost_usd DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Detail listing for one job, in insertion order.
    pub async fn for_job(&self, job_id: i64) -> Result<Vec<CostLedgerEntry>> {
        let rows: Vec<CostLedgerEntry> = sqlx::query_as(
            r#"
            SELECT * FROM kx_cost_ledger
            WHERE job_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Retention prune (≥90-day window in production).
    pub async fn prune_older_than(&self, days: u32) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(days as i64);
        let pruned = sqlx::query("DELETE FROM kx_cost_ledger WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewJob;
    use crate::Database;
    use klartext_crypto::FieldCipher;
    use klartext_protocol::ProcessingOptions;
    use serde_json::Map;

    async fn setup() -> (Database, i64) {
        let db = Database::open_in_memory(FieldCipher::from_key_bytes(&[5u8; 32]))
            .await
            .unwrap();
        let job = db
            .jobs()
            .create(NewJob {
                processing_id: "p-ledger".into(),
                filename: "doc.txt".into(),
                mime_type: "text/plain".into(),
                file_content: b"text".to_vec(),
                processing_options: ProcessingOptions::default(),
            })
            .await
            .unwrap();
        (db, job.id)
    }

    fn entry(job_id: i64, step: &str, input: i64, output: i64) -> NewCostEntry {
        NewCostEntry {
            job_id,
            step_name: step.into(),
            input_tokens: input,
            output_tokens: output,
            model_provider: "anthropic".into(),
            model_name: "claude-sonnet".into(),
            price_input_per_1m_tokens: Some(3.0),
            price_output_per_1m_tokens: Some(15.0),
            processing_time_seconds: 1.25,
            document_type: Some("ARZTBRIEF".into()),
            metadata: Map::new(),
        }
    }

    #[tokio::test]
    async fn cost_arithmetic_holds() {
        let (db, job_id) = setup().await;
        db.ledger().log(entry(job_id, "translate", 1_000_000, 2_000_000)).await.unwrap();

        let rows = db.ledger().for_job(job_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.total_tokens, row.input_tokens + row.output_tokens);
        assert!((row.input_cost_usd - 3.0).abs() < 1e-9);
        assert!((row.output_cost_usd - 30.0).abs() < 1e-9);
        assert!((row.total_cost_usd - (row.input_cost_usd + row.output_cost_usd)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_pricing_logs_zero_cost() {
        let (db, job_id) = setup().await;
        let mut unpriced = entry(job_id, "classify", 500, 100);
        unpriced.price_input_per_1m_tokens = None;
        unpriced.price_output_per_1m_tokens = None;
        db.ledger().log(unpriced).await.unwrap();

        let rows = db.ledger().for_job(job_id).await.unwrap();
        assert_eq!(rows[0].total_cost_usd, 0.0);
        assert_eq!(rows[0].total_tokens, 600);
    }

    #[tokio::test]
    async fn aggregations_group_correctly() {
        let (db, job_id) = setup().await;
        db.ledger().log(entry(job_id, "classify", 100, 50)).await.unwrap();
        db.ledger().log(entry(job_id, "translate", 200, 300)).await.unwrap();
        db.ledger().log(entry(job_id, "translate", 10, 10)).await.unwrap();

        let by_step = db.ledger().by_step().await.unwrap();
        assert_eq!(by_step.len(), 2);
        let translate = by_step.iter().find(|s| s.step_name == "translate").unwrap();
        assert_eq!(translate.entries, 2);
        assert_eq!(translate.total_tokens, 520);

        let by_model = db.ledger().by_model().await.unwrap();
        assert_eq!(by_model.len(), 1);
        assert_eq!(by_model[0].entries, 3);

        let window = db
            .ledger()
            .total_in_window(Utc::now() - Duration::hours(1), Utc::now() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(window.entries, 3);
        assert_eq!(window.total_tokens, 670);
    }
}
