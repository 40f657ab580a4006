//! CLI command implementations.

pub mod costs;
pub mod job;
pub mod serve;

use anyhow::{bail, Context, Result};

use klartext_crypto::FieldCipher;
use klartext_db::Database;

/// Shared command context assembled from global flags and environment.
pub struct CliContext {
    pub db_url: String,
    pub encryption_key: Option<String>,
}

impl CliContext {
    /// Open the state store with the configured field cipher.
    pub async fn open_database(&self) -> Result<Database> {
        let Some(key) = self.encryption_key.as_deref() else {
            bail!(
                "no encryption key configured; set KLARTEXT_ENCRYPTION_KEY \
                 (generate one with `klartext gen-key`)"
            );
        };
        let cipher = FieldCipher::from_base64(key).context("invalid KLARTEXT_ENCRYPTION_KEY")?;
        tracing::info!(
            db_url = %self.db_url,
            key_fingerprint = cipher.fingerprint(),
            "Opening state store"
        );
        Database::open(&self.db_url, cipher)
            .await
            .with_context(|| format!("failed to open state store at {}", self.db_url))
    }
}
