use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use saanjh_ingest::{maybe_build_scheduler, IngestConfig, IngestPipeline};
use saanjh_storage::{EventStore, PgEventStore};
use saanjh_web::AppState;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "saanjh-cli")]
#[command(about = "Saanjh event ingestion command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass and print the outcome.
    Ingest,
    /// Apply database migrations.
    Migrate,
    /// Serve the HTTP trigger (and the cron scheduler when enabled).
    Serve,
    /// Run the cron scheduler in the foreground.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = IngestConfig::from_env();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let store = connect_store(&config).await?;
            let pipeline = IngestPipeline::new(config, store)?;
            let report = pipeline.run_once().await;
            println!(
                "ingestion {}: fetched={} inserted={} updated={} duplicates={} rejected={}",
                if report.success { "succeeded" } else { "had failures" },
                report.stats.fetched,
                report.stats.inserted,
                report.stats.updated,
                report.stats.duplicates,
                report.stats.rejected,
            );
            for error in &report.errors {
                eprintln!("error: {error}");
            }
        }
        Commands::Migrate => {
            let store = PgEventStore::connect(&config.database_url, config.retention_days).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let store = connect_store(&config).await?;
            let pipeline = Arc::new(IngestPipeline::new(config.clone(), store)?);
            if let Some(sched) = maybe_build_scheduler(&config, pipeline.clone()).await? {
                sched.start().await?;
                info!(cron = %config.ingest_cron, "scheduler started");
            }
            let port: u16 = std::env::var("SAANJH_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000);
            let state = AppState::new(pipeline, config.trigger_secret.clone());
            saanjh_web::serve(state, port).await?;
        }
        Commands::Schedule => {
            let store = connect_store(&config).await?;
            let scheduler_config = IngestConfig {
                scheduler_enabled: true,
                ..config.clone()
            };
            let pipeline = Arc::new(IngestPipeline::new(config, store)?);
            let sched = maybe_build_scheduler(&scheduler_config, pipeline)
                .await?
                .ok_or_else(|| anyhow::anyhow!("scheduler did not start"))?;
            sched.start().await?;
            info!(cron = %scheduler_config.ingest_cron, "scheduler running, ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
        }
    }

    Ok(())
}

async fn connect_store(config: &IngestConfig) -> Result<Arc<dyn EventStore>> {
    let store = PgEventStore::connect(&config.database_url, config.retention_days).await?;
    Ok(Arc::new(store))
}
