//! Worker pool.
//!
//! N worker units pull tasks from the broker queue with bounded
//! concurrency; within a unit, one job runs end-to-end and step calls
//! are strictly sequential. Decrypted document bytes live only in the
//! unit's locals: the loaded job value is detached from the store.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{error, info, warn};

use klartext_db::{Database, DbError, Job, QueueTask};
use klartext_llm::ProviderRegistry;
use klartext_pipeline::{ExecutorConfig, PipelineError, PipelineExecutor};
use klartext_protocol::defaults::ERROR_TIMEOUT;
use klartext_protocol::{
    CancellationToken, JobStatus, PipelineOutcome, SystemConfig,
};

use crate::cancel::CancelRegistry;
use crate::extract::{PiiScrubber, TextExtractor};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("storage error: {0}")]
    Db(#[from] DbError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Shared worker-pool wiring; `spawn` starts the units.
pub struct WorkerPool {
    db: Database,
    providers: Arc<ProviderRegistry>,
    extractor: Arc<dyn TextExtractor>,
    scrubber: Arc<dyn PiiScrubber>,
    cancels: Arc<CancelRegistry>,
    config: SystemConfig,
}

impl WorkerPool {
    pub fn new(
        db: Database,
        providers: Arc<ProviderRegistry>,
        extractor: Arc<dyn TextExtractor>,
        scrubber: Arc<dyn PiiScrubber>,
        cancels: Arc<CancelRegistry>,
        config: SystemConfig,
    ) -> Self {
        Self {
            db,
            providers,
            extractor,
            scrubber,
            cancels,
            config,
        }
    }

    /// Start the configured number of worker units. Flipping the watch
    /// channel to `true` requests a graceful shutdown: each unit
    /// finishes its current job, then exits.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> JoinSet<()> {
        let mut units = JoinSet::new();
        for index in 0..self.config.workers.max(1) {
            let unit = WorkerUnit {
                worker_id: format!("worker-{index}"),
                db: self.db.clone(),
                providers: Arc::clone(&self.providers),
                extractor: Arc::clone(&self.extractor),
                scrubber: Arc::clone(&self.scrubber),
                cancels: Arc::clone(&self.cancels),
                config: self.config.clone(),
            };
            let shutdown = shutdown.clone();
            units.spawn(async move { unit.run(shutdown).await });
        }
        info!(workers = self.config.workers.max(1), "Worker pool started");
        units
    }
}

/// A single-job executor: claims one task at a time and drives it to a
/// terminal state.
struct WorkerUnit {
    worker_id: String,
    db: Database,
    providers: Arc<ProviderRegistry>,
    extractor: Arc<dyn TextExtractor>,
    scrubber: Arc<dyn PiiScrubber>,
    cancels: Arc<CancelRegistry>,
    config: SystemConfig,
}

impl WorkerUnit {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.worker_id, "Entering claim loop");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.db.queue().claim(&self.worker_id).await {
                Ok(Some(task)) => {
                    let processing_id = task.processing_id.clone();
                    if let Err(err) = self.process_task(task).await {
                        // The task stays unacknowledged; heartbeat decay
                        // returns it to the queue for redelivery.
                        error!(
                            worker_id = %self.worker_id,
                            %processing_id,
                            error = %err,
                            "Task processing failed"
                        );
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.queue_poll) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(err) => {
                    error!(worker_id = %self.worker_id, error = %err, "Queue claim failed");
                    tokio::time::sleep(self.config.queue_poll).await;
                }
            }
        }
        info!(worker_id = %self.worker_id, "Worker stopped");
    }

    async fn process_task(&self, task: QueueTask) -> Result<(), WorkerError> {
        // Broker delivery is at-least-once; deduplicate by job status.
        let job = match self.db.jobs().get_by_processing_id(&task.processing_id).await {
            Ok(job) => job,
            Err(DbError::NotFound(_)) => {
                warn!(processing_id = %task.processing_id, "Task references unknown job; dropping");
                self.ack(&task, None).await?;
                return Ok(());
            }
            Err(DbError::Decryption(err)) => {
                // Never retried and never degraded to plaintext: the job
                // fails immediately.
                error!(
                    processing_id = %task.processing_id,
                    error = %err,
                    "Job payload failed to decrypt"
                );
                self.db
                    .jobs()
                    .fail_by_processing_id(&task.processing_id, &format!("decryption error: {err}"))
                    .await?;
                self.ack(&task, None).await?;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        if job.status.is_terminal() || job.status == JobStatus::Running {
            info!(
                processing_id = %task.processing_id,
                status = %job.status,
                "Duplicate delivery dropped"
            );
            self.ack(&task, None).await?;
            return Ok(());
        }
        if !self.db.jobs().mark_running(&task.processing_id).await? {
            self.ack(&task, None).await?;
            return Ok(());
        }

        let cancel = self.cancels.register(&task.processing_id);
        let heartbeat = self.spawn_heartbeat(task.id);

        let outcome = match timeout(
            self.config.job_timeout,
            self.run_job(&job, &cancel),
        )
        .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                error!(job_id = job.id, error = %err, "Job infrastructure failure");
                PipelineOutcome::failed(err.to_string())
            }
            Err(_) => {
                warn!(job_id = job.id, "Job exceeded its wall-clock budget");
                PipelineOutcome::failed(ERROR_TIMEOUT)
            }
        };

        heartbeat.abort();
        self.cancels.remove(&task.processing_id);
        self.finalize(&job, &task, outcome).await
    }

    /// OCR -> scrub -> execute. Decrypted bytes never leave this frame.
    async fn run_job(
        &self,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, WorkerError> {
        let extraction = match self.extractor.extract(&job.file_content, &job.mime_type).await {
            Ok(extraction) => extraction,
            Err(err) => {
                return Ok(PipelineOutcome::failed(format!("text extraction failed: {err}")))
            }
        };
        info!(
            job_id = job.id,
            text_len = extraction.text.len(),
            confidence = extraction.confidence,
            "Text extracted"
        );

        let scrubbed = match self.scrubber.scrub(&extraction.text).await {
            Ok(scrubbed) => scrubbed,
            Err(err) => return Ok(PipelineOutcome::failed(format!("PII scrub failed: {err}"))),
        };

        // Snapshot the configuration for this run; mid-flight changes
        // do not apply.
        let snapshot = self.db.config().load_snapshot().await?;
        let executor = PipelineExecutor::new(self.db.clone(), Arc::clone(&self.providers))
            .with_config(ExecutorConfig {
                step_timeout: self.config.step_timeout,
                ..ExecutorConfig::default()
            });

        match executor.execute(job, &scrubbed, &snapshot, cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(PipelineError::Config(message)) => {
                Ok(PipelineOutcome::failed(format!("configuration error: {message}")))
            }
            Err(PipelineError::Db(err)) => Ok(PipelineOutcome::failed(err.to_string())),
        }
    }

    /// Map the outcome to the job's terminal state and acknowledge the
    /// broker task with a result payload.
    async fn finalize(
        &self,
        job: &Job,
        task: &QueueTask,
        outcome: PipelineOutcome,
    ) -> Result<(), WorkerError> {
        match &outcome {
            PipelineOutcome::Completed { result } => {
                self.db
                    .jobs()
                    .finish(job.id, JobStatus::Completed, None, Some(result))
                    .await?;
            }
            PipelineOutcome::Failed { step_name, error } => {
                let message = match step_name {
                    Some(step) => format!("step '{step}' failed: {error}"),
                    None => error.clone(),
                };
                self.db
                    .jobs()
                    .finish(job.id, JobStatus::Failed, Some(&message), None)
                    .await?;
            }
            PipelineOutcome::Terminated { result, .. } => {
                self.db
                    .jobs()
                    .finish(job.id, JobStatus::Terminated, None, Some(result))
                    .await?;
            }
        }

        let summary = json!({
            "processing_id": job.processing_id,
            "status": outcome.job_status(),
        })
        .to_string();
        self.ack(task, Some(&summary)).await
    }

    async fn ack(&self, task: &QueueTask, result: Option<&str>) -> Result<(), WorkerError> {
        self.db
            .queue()
            .ack(task.id, result, self.config.result_ttl.as_secs())
            .await?;
        Ok(())
    }

    fn spawn_heartbeat(&self, task_id: i64) -> tokio::task::JoinHandle<()> {
        let queue_db = self.db.clone();
        let interval = self.config.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.tick().await; // first tick is immediate
            loop {
                ticker.tick().await;
                if let Err(err) = queue_db.queue().heartbeat(task_id).await {
                    warn!(task_id, error = %err, "Heartbeat write failed");
                }
            }
        })
    }
}
