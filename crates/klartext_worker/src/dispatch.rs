//! Job dispatch and cancellation intents.
//!
//! The thin surface external collaborators (HTTP API, CLI) use to hand
//! jobs to the scheduler. Enqueueing is idempotent per processing id;
//! cancellation is cooperative and reaches either the queued task or
//! the running worker's token.

use std::sync::Arc;

use tracing::info;

use klartext_db::{Database, DbError};
use klartext_protocol::defaults::ERROR_CANCELLED;
use klartext_protocol::{JobStatus, ProcessingOptions};

use crate::cancel::CancelRegistry;

pub struct JobDispatcher {
    db: Database,
    cancels: Arc<CancelRegistry>,
}

impl JobDispatcher {
    pub fn new(db: Database, cancels: Arc<CancelRegistry>) -> Self {
        Self { db, cancels }
    }

    /// Publish a task for an existing job and move it to QUEUED.
    ///
    /// Idempotent: a second call for the same processing id returns the
    /// existing active task's id, and pickup deduplicates by job status
    /// regardless.
    pub async fn enqueue(
        &self,
        processing_id: &str,
        options: &ProcessingOptions,
    ) -> Result<i64, DbError> {
        // Fails with NotFound before anything is published.
        let job = self.db.jobs().get_by_processing_id(processing_id).await?;
        if job.status.is_terminal() {
            return Err(DbError::invalid_state(format!(
                "job {processing_id} is already {}",
                job.status
            )));
        }

        let task_id = self.db.queue().enqueue(processing_id, options, 0).await?;
        self.db.jobs().mark_queued(processing_id).await?;
        Ok(task_id)
    }

    /// Record a cancellation intent. Queued tasks are cancelled in the
    /// broker; a running job's worker observes the token between steps.
    /// Returns whether anything was reachable to cancel.
    pub async fn cancel(&self, processing_id: &str) -> Result<bool, DbError> {
        let dequeued = self.db.queue().cancel_queued(processing_id).await?;
        let signalled = self.cancels.cancel(processing_id);

        if dequeued && !signalled {
            // Never picked up: no worker will finalize it, so close the
            // job here.
            let job = self.db.jobs().get_by_processing_id(processing_id).await?;
            if !job.status.is_terminal() {
                self.db
                    .jobs()
                    .finish(job.id, JobStatus::Failed, Some(ERROR_CANCELLED), None)
                    .await?;
            }
        }

        if dequeued || signalled {
            info!(%processing_id, dequeued, signalled, "Cancellation requested");
        }
        Ok(dequeued || signalled)
    }
}
