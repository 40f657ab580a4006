//! Klartext launcher.
//!
//! Operational surface for the pipeline engine: run the worker pool,
//! enqueue documents, inspect job state, cancel, and report costs. The
//! HTTP front-end lives elsewhere and talks to the same store.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use klartext_logging::LogConfig;

mod cli;

#[derive(Parser, Debug)]
#[command(name = "klartext", about = "Medical document pipeline engine")]
struct Cli {
    /// Enable verbose logging (full filter to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// State store URL
    #[arg(long, global = true, env = "KLARTEXT_DB_URL")]
    db_url: Option<String>,

    /// Base64-encoded 256-bit field encryption key
    #[arg(long, global = true, env = "KLARTEXT_ENCRYPTION_KEY", hide_env_values = true)]
    encryption_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the worker pool and maintenance tasks until interrupted
    Serve {
        /// Number of concurrent worker units
        #[arg(long, env = "KLARTEXT_WORKERS")]
        workers: Option<usize>,
    },

    /// Create a job from a document and publish it to the queue
    Enqueue {
        /// Document to process
        file: PathBuf,

        /// Target language code (e.g. de, en, fr)
        #[arg(long)]
        target_language: Option<String>,

        /// Skip classification and use this class key
        #[arg(long)]
        document_type_hint: Option<String>,
    },

    /// Show a job's status, progress and step executions
    Status {
        processing_id: String,
    },

    /// Request cooperative cancellation of a job
    Cancel {
        processing_id: String,
    },

    /// Cost report: totals and breakdowns, or one job's entries
    Costs {
        /// Restrict to one job
        #[arg(long)]
        job: Option<String>,
    },

    /// Generate a fresh base64 field encryption key
    GenKey,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    klartext_logging::init_logging(LogConfig {
        app_name: "klartext",
        verbose: args.verbose,
    })?;

    let ctx = cli::CliContext {
        db_url: args
            .db_url
            .unwrap_or_else(|| klartext_protocol::defaults::DEFAULT_DB_URL.to_string()),
        encryption_key: args.encryption_key,
    };

    match args.command {
        Commands::Serve { workers } => cli::serve::run(ctx, workers).await,
        Commands::Enqueue {
            file,
            target_language,
            document_type_hint,
        } => cli::job::enqueue(ctx, file, target_language, document_type_hint).await,
        Commands::Status { processing_id } => cli::job::status(ctx, &processing_id).await,
        Commands::Cancel { processing_id } => cli::job::cancel(ctx, &processing_id).await,
        Commands::Costs { job } => cli::costs::run(ctx, job.as_deref()).await,
        Commands::GenKey => {
            let (_, encoded) = klartext_crypto::FieldCipher::generate();
            println!("{encoded}");
            Ok(())
        }
    }
}
