//! Job scheduler and worker pool.
//!
//! Moves jobs from the broker queue to the pipeline executor with
//! bounded concurrency: N worker units each process one job end-to-end
//! (claim -> load/decrypt -> OCR -> PII scrub -> execute -> finalize), with
//! per-job timeouts, task heartbeats, cooperative cancellation and
//! cron-style maintenance sweeps.

pub mod cancel;
pub mod dispatch;
pub mod extract;
pub mod maintenance;
pub mod worker;

pub use cancel::CancelRegistry;
pub use dispatch::JobDispatcher;
pub use extract::{
    Extraction, ExtractError, PiiScrubber, PlainTextExtractor, RegexScrubber, TextExtractor,
};
pub use klartext_protocol::CancellationToken;
pub use worker::{WorkerError, WorkerPool};
