//! System configuration shared by the launcher and the worker pool.

use crate::defaults;
use std::time::Duration;

/// Canonical system configuration handed to the worker pool and the
/// maintenance tasks. Plain data; the binary assembles it from CLI
/// flags and environment variables.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// State store URL (sqlite:...).
    pub db_url: String,
    /// Number of concurrent worker units.
    pub workers: usize,
    /// Overall wall-clock budget per job.
    pub job_timeout: Duration,
    /// Budget per LLM invocation.
    pub step_timeout: Duration,
    /// Broker task heartbeat interval.
    pub heartbeat_interval: Duration,
    /// RUNNING jobs idle longer than this are failed as orphaned.
    pub stale_job_after: Duration,
    /// Claimed tasks without a heartbeat for this long are redelivered.
    pub stale_task_after: Duration,
    /// Idle sleep between queue polls.
    pub queue_poll: Duration,
    /// Job and step execution retention window.
    pub job_retention_days: u32,
    /// Cost ledger retention window.
    pub ledger_retention_days: u32,
    /// TTL for broker result payloads.
    pub result_ttl: Duration,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            db_url: defaults::DEFAULT_DB_URL.to_string(),
            workers: defaults::DEFAULT_WORKERS,
            job_timeout: Duration::from_secs(defaults::DEFAULT_JOB_TIMEOUT_SECS),
            step_timeout: Duration::from_secs(defaults::DEFAULT_STEP_TIMEOUT_SECS),
            heartbeat_interval: Duration::from_secs(defaults::DEFAULT_HEARTBEAT_INTERVAL_SECS),
            stale_job_after: Duration::from_secs(defaults::DEFAULT_STALE_JOB_SECS),
            stale_task_after: Duration::from_secs(defaults::DEFAULT_STALE_TASK_SECS),
            queue_poll: Duration::from_millis(defaults::DEFAULT_QUEUE_POLL_MS),
            job_retention_days: defaults::DEFAULT_JOB_RETENTION_DAYS,
            ledger_retention_days: defaults::DEFAULT_LEDGER_RETENTION_DAYS,
            result_ttl: Duration::from_secs(defaults::DEFAULT_RESULT_TTL_SECS),
        }
    }
}
