//! `klartext enqueue` / `status` / `cancel`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use klartext_db::NewJob;
use klartext_protocol::ProcessingOptions;
use klartext_worker::{CancelRegistry, JobDispatcher};

use super::CliContext;

pub async fn enqueue(
    ctx: CliContext,
    file: PathBuf,
    target_language: Option<String>,
    document_type_hint: Option<String>,
) -> Result<()> {
    let db = ctx.open_database().await?;

    let bytes = tokio::fs::read(&file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let filename = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());

    let options = ProcessingOptions {
        target_language,
        document_type_hint,
    };
    let processing_id = uuid::Uuid::new_v4().simple().to_string();

    let job = db
        .jobs()
        .create(NewJob {
            processing_id: processing_id.clone(),
            filename,
            mime_type: guess_mime(&file),
            file_content: bytes,
            processing_options: options.clone(),
        })
        .await?;

    let dispatcher = JobDispatcher::new(db, Arc::new(CancelRegistry::new()));
    let task_id = dispatcher.enqueue(&processing_id, &options).await?;

    println!("processing_id: {processing_id}");
    println!("job_id:        {}", job.id);
    println!("task_id:       {task_id}");
    Ok(())
}

pub async fn status(ctx: CliContext, processing_id: &str) -> Result<()> {
    let db = ctx.open_database().await?;
    let job = db.jobs().get_by_processing_id(processing_id).await?;

    println!("processing_id: {}", job.processing_id);
    println!("filename:      {}", job.filename);
    println!("status:        {}", job.status);
    println!("progress:      {}%", job.progress_percent);
    if let Some(error) = &job.error_message {
        println!("error:         {error}");
    }
    if !job.result_data.is_empty() {
        println!("result:        {}", serde_json::to_string_pretty(&job.result_data)?);
    }

    let executions = db.steps().for_job(job.id).await?;
    if !executions.is_empty() {
        println!("steps:");
        for execution in executions {
            println!(
                "  [{}] {} attempt {}: {}{}",
                execution.step_order,
                execution.step_name,
                execution.attempt,
                execution.status,
                execution
                    .error_message
                    .map(|e| format!(" ({e})"))
                    .unwrap_or_default()
            );
        }
    }
    Ok(())
}

pub async fn cancel(ctx: CliContext, processing_id: &str) -> Result<()> {
    let db = ctx.open_database().await?;
    let dispatcher = JobDispatcher::new(db, Arc::new(CancelRegistry::new()));
    if dispatcher.cancel(processing_id).await? {
        println!("cancellation requested for {processing_id}");
    } else {
        println!("nothing to cancel for {processing_id} (not queued on this node)");
    }
    Ok(())
}

fn guess_mime(path: &Path) -> String {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("txt") => "text/plain",
        Some("md") => "text/markdown",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
    .to_string()
}
