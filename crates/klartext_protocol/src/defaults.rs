//! Canonical default values shared across the scheduler and worker pool.

/// Overall wall-clock budget for one job.
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 30 * 60;
/// Budget for a single LLM invocation.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 5 * 60;
/// How often a worker re-asserts ownership of its broker task.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 60;
/// A RUNNING job with no activity for this long is considered orphaned.
pub const DEFAULT_STALE_JOB_SECS: u64 = 60 * 60;
/// How often the orphan sweep runs.
pub const DEFAULT_ORPHAN_SWEEP_SECS: u64 = 10 * 60;
/// A claimed task with no heartbeat for this long is redelivered.
pub const DEFAULT_STALE_TASK_SECS: u64 = 3 * 60;

pub const DEFAULT_JOB_RETENTION_DAYS: u32 = 7;
pub const DEFAULT_LEDGER_RETENTION_DAYS: u32 = 90;
/// TTL for broker result payloads.
pub const DEFAULT_RESULT_TTL_SECS: u64 = 24 * 60 * 60;

pub const DEFAULT_WORKERS: usize = 4;
/// Idle sleep between queue polls.
pub const DEFAULT_QUEUE_POLL_MS: u64 = 500;
/// Exponential backoff base and cap for step retries.
pub const DEFAULT_RETRY_BASE_MS: u64 = 500;
pub const DEFAULT_RETRY_CAP_MS: u64 = 30_000;

pub const DEFAULT_DB_URL: &str = "sqlite:klartext.db";

/// Error strings surfaced on the job row for non-step failures.
pub const ERROR_CANCELLED: &str = "cancelled";
pub const ERROR_TIMEOUT: &str = "timeout";
pub const ERROR_ORPHANED: &str = "orphaned";
