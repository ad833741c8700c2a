use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use goshoin_storage::{BookstoreStore, PgBookstoreStore};
use goshoin_sync::{maybe_build_scheduler, SyncConfig, SyncPipeline};
use goshoin_web::{AppState, WebConfig};
use tracing::info;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "goshoin-cli")]
#[command(about = "Bookstore directory sync and API server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one roster sync and print the outcome.
    Sync,
    /// Apply database migrations.
    Migrate,
    /// Serve the HTTP API, with the daily scheduler when enabled.
    Serve,
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing("info,sqlx=warn")?;

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let store = PgBookstoreStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening database for {}", Redacted(&config.database_url)))?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let store: Arc<dyn BookstoreStore> = Arc::new(store);
            let pipeline = SyncPipeline::from_config(&config, store)?;
            let outcome = pipeline.run_once().await;
            println!(
                "sync complete: success={} updated={} errors={}",
                outcome.success, outcome.updated_count, outcome.error_count
            );
            if !outcome.success {
                anyhow::bail!("sync run aborted; see update log for details");
            }
        }
        Commands::Migrate => {
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            store.migrate().await?;
            let web = WebConfig::from_env();
            let store: Arc<dyn BookstoreStore> = Arc::new(store);
            let pipeline = Arc::new(SyncPipeline::from_config(&config, Arc::clone(&store))?);

            let scheduler = maybe_build_scheduler(&config, Arc::clone(&pipeline)).await?;
            if let Some(scheduler) = &scheduler {
                scheduler.start().await.context("starting scheduler")?;
                info!(cron = %config.sync_cron, "daily sync scheduled");
            }

            goshoin_web::serve(&web, AppState::new(store, pipeline, web.cron_secret.clone())).await?;
        }
    }

    Ok(())
}

/// Displays a connection URL without its password.
struct Redacted<'a>(&'a str);

impl std::fmt::Display for Redacted<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.0.find("://"), self.0.rfind('@')) {
            (Some(scheme_end), Some(at)) if at > scheme_end => {
                write!(f, "{}://***{}", &self.0[..scheme_end], &self.0[at..])
            }
            _ => f.write_str(self.0),
        }
    }
}
