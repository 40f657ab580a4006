//! Periodic maintenance sweeps.
//!
//! Cron-style background loops spawned alongside the worker pool:
//! orphan detection (lost workers), retention purges, and broker result
//! expiry. Each sweep is also exposed as a one-shot function so tests
//! and operators can run it on demand.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use klartext_db::{Database, DbError};
use klartext_protocol::defaults::DEFAULT_ORPHAN_SWEEP_SECS;
use klartext_protocol::SystemConfig;

const RETENTION_SWEEP: Duration = Duration::from_secs(24 * 60 * 60);
const RESULT_EXPIRY_SWEEP: Duration = Duration::from_secs(60 * 60);

/// Redeliver stale tasks and fail orphaned jobs. Returns
/// `(requeued_tasks, orphaned_jobs)`.
pub async fn sweep_orphans(db: &Database, config: &SystemConfig) -> Result<(u64, usize), DbError> {
    let requeued = db
        .queue()
        .requeue_stale(config.stale_task_after.as_secs())
        .await?;
    let orphaned = db
        .jobs()
        .fail_orphaned(config.stale_job_after.as_secs())
        .await?;
    Ok((requeued, orphaned.len()))
}

/// Purge jobs past the job retention window and ledger rows past the
/// (longer) ledger retention window. Returns `(jobs, ledger_rows)`.
pub async fn sweep_retention(db: &Database, config: &SystemConfig) -> Result<(u64, u64), DbError> {
    let jobs = db.jobs().purge_older_than(config.job_retention_days).await?;
    let ledger = db
        .ledger()
        .prune_older_than(config.ledger_retention_days)
        .await?;
    Ok((jobs, ledger))
}

/// Drop broker result payloads past their TTL.
pub async fn sweep_expired_results(db: &Database) -> Result<u64, DbError> {
    db.queue().expire_results().await
}

/// Spawn the maintenance loops. They exit when the shutdown channel
/// flips to `true`.
pub fn spawn_maintenance(
    db: Database,
    config: SystemConfig,
    shutdown: watch::Receiver<bool>,
) -> JoinSet<()> {
    let mut tasks = JoinSet::new();

    {
        let db = db.clone();
        let config = config.clone();
        let mut shutdown = shutdown.clone();
        tasks.spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(DEFAULT_ORPHAN_SWEEP_SECS));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match sweep_orphans(&db, &config).await {
                            Ok((requeued, orphaned)) if requeued > 0 || orphaned > 0 => {
                                info!(requeued, orphaned, "Orphan sweep");
                            }
                            Ok(_) => {}
                            Err(err) => error!(error = %err, "Orphan sweep failed"),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    {
        let db = db.clone();
        let config = config.clone();
        let mut shutdown = shutdown.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(RETENTION_SWEEP);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match sweep_retention(&db, &config).await {
                            Ok((jobs, ledger)) if jobs > 0 || ledger > 0 => {
                                info!(jobs, ledger, "Retention sweep");
                            }
                            Ok(_) => {}
                            Err(err) => error!(error = %err, "Retention sweep failed"),
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    {
        let mut shutdown = shutdown.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(RESULT_EXPIRY_SWEEP);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = sweep_expired_results(&db).await {
                            error!(error = %err, "Result expiry sweep failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    tasks
}
