//! `klartext serve`: run the worker pool until interrupted.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{info, warn};

use klartext_llm::{AnthropicProvider, OpenAiProvider, ProviderRegistry};
use klartext_protocol::SystemConfig;
use klartext_worker::{
    maintenance, CancelRegistry, PlainTextExtractor, RegexScrubber, WorkerPool,
};

use super::CliContext;

pub async fn run(ctx: CliContext, workers: Option<usize>) -> Result<()> {
    let db = ctx.open_database().await?;

    let mut config = SystemConfig {
        db_url: ctx.db_url.clone(),
        ..SystemConfig::default()
    };
    if let Some(workers) = workers {
        config.workers = workers.max(1);
    }

    let mut registry = ProviderRegistry::new();
    match AnthropicProvider::from_env() {
        Ok(provider) => registry.register(Arc::new(provider)),
        Err(err) => info!("Anthropic provider not configured: {err}"),
    }
    match OpenAiProvider::from_env() {
        Ok(provider) => registry.register(Arc::new(provider)),
        Err(err) => info!("OpenAI provider not configured: {err}"),
    }
    if registry.is_empty() {
        warn!("No LLM providers configured; steps will fail until a provider key is set");
    }

    let cancels = Arc::new(CancelRegistry::new());
    let pool = WorkerPool::new(
        db.clone(),
        Arc::new(registry),
        Arc::new(PlainTextExtractor),
        Arc::new(RegexScrubber::new()),
        cancels,
        config.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut units = pool.spawn(shutdown_rx.clone());
    let mut sweeps = maintenance::spawn_maintenance(db, config, shutdown_rx);

    info!("Serving; press Ctrl-C to shut down");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested; letting workers finish their current jobs");
    let _ = shutdown_tx.send(true);

    while units.join_next().await.is_some() {}
    sweeps.abort_all();
    while sweeps.join_next().await.is_some() {}

    info!("Shutdown complete");
    Ok(())
}
