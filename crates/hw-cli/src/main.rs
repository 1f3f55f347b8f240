use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hw_core::Subscriber;
use hw_storage::SubscriberDirectory;
use hw_sync::{SyncConfig, SyncRuntime};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hw-cli")]
#[command(about = "House Watch listing ingestion and reporting")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest every page in pages.yaml once.
    Sync,
    /// Ingest a single page (defaults to the registry's current page).
    Pull {
        #[arg(long)]
        page: Option<u32>,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the reporting API; starts the scheduler when HW_SCHEDULER_ENABLED is set.
    Serve,
    /// Register a notification recipient.
    Subscribe { contact_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let mut failed = 0usize;
            for (page, result) in hw_sync::run_sync_once_from_env().await? {
                match result {
                    Ok(report) => println!("{}", serde_json::to_string(&report)?),
                    Err(err) => {
                        failed += 1;
                        warn!(page, error = %err, "page ingestion failed");
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{failed} page(s) failed to ingest");
            }
        }
        Commands::Pull { page } => {
            let runtime = SyncRuntime::from_config(SyncConfig::from_env()).await?;
            let page = page.unwrap_or(runtime.service.registry().current_page);
            let report = runtime.service.ingest_page(page).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let url = config
                .database_url
                .context("DATABASE_URL must be set to run migrations")?;
            let pool = hw_storage::connect_pool(&url).await?;
            hw_storage::run_migrations(&pool).await?;
            info!("migrations applied");
        }
        Commands::Serve => {
            let runtime = SyncRuntime::from_config(SyncConfig::from_env()).await?;
            let scheduler = runtime.maybe_build_scheduler().await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!("scheduler started");
            }
            let state = hw_web::AppState::from_runtime(&runtime)?;
            hw_web::serve(state, hw_web::port_from_env()).await?;
        }
        Commands::Subscribe { contact_id } => {
            let runtime = SyncRuntime::from_config(SyncConfig::from_env()).await?;
            runtime.directory.register(&Subscriber::new(contact_id.clone())).await?;
            info!(%contact_id, "subscriber registered");
        }
    }

    Ok(())
}
