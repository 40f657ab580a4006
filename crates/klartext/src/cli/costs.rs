//! `klartext costs`: ledger report.

use anyhow::Result;
use chrono::{Duration, Utc};

use super::CliContext;

const WINDOW_DAYS: i64 = 30;

pub async fn run(ctx: CliContext, job: Option<&str>) -> Result<()> {
    let db = ctx.open_database().await?;
    let ledger = db.ledger();

    if let Some(processing_id) = job {
        let job = db.jobs().get_by_processing_id(processing_id).await?;
        let entries = ledger.for_job(job.id).await?;
        println!("cost entries for {processing_id}:");
        for entry in &entries {
            println!(
                "  {}: {} in / {} out tokens: ${:.6} ({} {})",
                entry.step_name,
                entry.input_tokens,
                entry.output_tokens,
                entry.total_cost_usd,
                entry.model_provider,
                entry.model_name,
            );
        }
        let total: f64 = entries.iter().map(|e| e.total_cost_usd).sum();
        println!("total: ${total:.6} over {} calls", entries.len());
        return Ok(());
    }

    let now = Utc::now();
    let totals = ledger.total_in_window(now - Duration::days(WINDOW_DAYS), now).await?;
    println!(
        "last {WINDOW_DAYS} days: {} calls, {} tokens, ${:.4}",
        totals.entries, totals.total_tokens, totals.total_cost_usd
    );

    let by_model = ledger.by_model().await?;
    if !by_model.is_empty() {
        println!("by model:");
        for row in by_model {
            println!(
                "  {}/{}: {} calls, {} tokens, ${:.4}",
                row.model_provider, row.model_name, row.entries, row.total_tokens, row.total_cost_usd
            );
        }
    }

    let by_step = ledger.by_step().await?;
    if !by_step.is_empty() {
        println!("by step:");
        for row in by_step {
            println!(
                "  {}: {} calls, {} tokens, ${:.4}",
                row.step_name, row.entries, row.total_tokens, row.total_cost_usd
            );
        }
    }
    Ok(())
}
