use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dealfeed_storage::PgDealStore;
use dealfeed_sync::{build_scheduler, maybe_build_scheduler, pipeline_from_config, FeedConfig, PollSummary};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dealfeed-cli")]
#[command(about = "Mirror a Telegram deals channel into the site feed")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one poll cycle and print the summary as JSON.
    Poll,
    /// Apply database migrations.
    Migrate,
    /// Serve the HTTP endpoints (and the cron trigger when enabled).
    Serve,
    /// Run the cron trigger without the HTTP server.
    Schedule,
}

fn init_logging() {
    // RUST_LOG wins when set.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dealfeed=info,sqlx=warn,reqwest=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = FeedConfig::from_env();
    info!(
        channel = %config.telegram_channel,
        dev_mode = config.dev_mode(),
        batch_size = config.batch_size,
        max_attempts = config.max_attempts,
        "loaded config"
    );

    match cli.command.unwrap_or(Commands::Poll) {
        Commands::Poll => {
            let pipeline = pipeline_from_config(&config).await?;
            let summary = pipeline.run_once().await?;
            println!("{}", summary_line(&summary)?);
        }
        Commands::Migrate => {
            let database_url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for migrate")?;
            let store = PgDealStore::connect(database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let pipeline = Arc::new(pipeline_from_config(&config).await?);
            let scheduler = maybe_build_scheduler(&config, Arc::clone(&pipeline)).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.poll_cron, "scheduler started");
            }
            dealfeed_web::serve(&config, pipeline).await?;
        }
        Commands::Schedule => {
            let pipeline = Arc::new(pipeline_from_config(&config).await?);
            let mut sched = build_scheduler(pipeline, &config.poll_cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.poll_cron, "scheduler started; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            warn!("shutting down scheduler");
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

fn summary_line(summary: &PollSummary) -> Result<String> {
    serde_json::to_string(summary).context("serializing poll summary")
}
