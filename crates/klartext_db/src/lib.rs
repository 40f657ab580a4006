//! Encrypted persistence layer for the Klartext pipeline engine.
//!
//! Every store hands out detached plain-data values and accepts
//! column-targeted writes; there is no tracked-entity session that could
//! re-flush decrypted sensitive fields back to disk. Sensitive columns
//! (`kx_jobs.file_content`, `kx_step_executions.input_text` /
//! `output_text`) pass through [`klartext_crypto::FieldCipher`] on every
//! read and write.

pub mod config_store;
pub mod error;
pub mod jobs;
pub mod ledger;
pub mod models;
pub mod queue;
pub mod schema;
pub mod steps;

use std::str::FromStr;
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};

use klartext_crypto::FieldCipher;

pub use config_store::{ConfigSnapshot, ConfigStore, NewPipelineStep};
pub use error::{DbError, Result};
pub use jobs::JobStore;
pub use ledger::CostLedger;
pub use models::{
    CostLedgerEntry, DocumentClass, Job, ModelSpec, NewCostEntry, NewJob, NewStepExecution,
    PipelineStep, QueueTask, StepExecution, UpdateJob,
};
pub use queue::{QueueStats, TaskQueue};
pub use steps::StepExecutionStore;

/// Handle to the state store: connection pool plus field cipher.
///
/// Cheap to clone; each accessor returns a lightweight store over the
/// shared pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
    cipher: Arc<FieldCipher>,
}

impl Database {
    /// Open (and create if missing) the state store at `url` and install
    /// the schema.
    pub async fn open(url: &str, cipher: FieldCipher) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let db = Self {
            pool,
            cipher: Arc::new(cipher),
        };
        schema::migrate(&db.pool).await?;
        Ok(db)
    }

    /// In-memory store for tests. A single connection keeps every query
    /// on the same database.
    pub async fn open_in_memory(cipher: FieldCipher) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let db = Self {
            pool,
            cipher: Arc::new(cipher),
        };
        schema::migrate(&db.pool).await?;
        Ok(db)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub fn cipher(&self) -> &Arc<FieldCipher> {
        &self.cipher
    }

    pub fn jobs(&self) -> JobStore {
        JobStore::new(self.pool.clone(), Arc::clone(&self.cipher))
    }

    pub fn steps(&self) -> StepExecutionStore {
        StepExecutionStore::new(self.pool.clone(), Arc::clone(&self.cipher))
    }

    pub fn ledger(&self) -> CostLedger {
        CostLedger::new(self.pool.clone())
    }

    pub fn config(&self) -> ConfigStore {
        ConfigStore::new(self.pool.clone())
    }

    pub fn queue(&self) -> TaskQueue {
        TaskQueue::new(self.pool.clone())
    }
}
