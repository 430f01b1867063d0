use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use velu_api::app::{build_app, AppState};
use velu_api::config::{AppConfig, Env};
use velu_registry::TaskRegistry;
use velu_store::{migrations, MemoryStore, PostgresStore, SharedStore};
use velu_worker::{Worker, WorkerConfig};

#[derive(Parser)]
#[command(name = "velu", version, about = "Multi-tenant job queue service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP gateway.
    Serve {
        #[arg(long, env = "VELU_BIND", default_value = "0.0.0.0:8080")]
        bind: String,
    },
    /// Run a worker process against the configured store.
    Worker,
    /// Apply pending database migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    velu_observability::init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();

    match cli.command {
        Command::Serve { bind } => serve(config, &bind).await,
        Command::Worker => worker(config).await,
        Command::Migrate => migrate(config).await,
    }
}

async fn build_store(config: &AppConfig, run_migrations: bool) -> anyhow::Result<SharedStore> {
    if config.jobs_backend_postgres {
        let url = config
            .database_url
            .as_deref()
            .context("DATABASE_URL is required with VELU_JOBS_BACKEND=postgres")?;
        if run_migrations {
            migrations::migrate(url).await?;
        }
        let store = PostgresStore::connect(url).await?;
        Ok(Arc::new(store))
    } else {
        tracing::info!("using in-memory store (single node; state is not durable)");
        let store = if config.store_credentials {
            MemoryStore::tenanted()
        } else {
            MemoryStore::new()
        };
        Ok(Arc::new(store))
    }
}

fn registered_task_names() -> BTreeSet<String> {
    TaskRegistry::builtin().names()
}

async fn serve(config: AppConfig, bind: &str) -> anyhow::Result<()> {
    let store = build_store(&config, true).await?;
    let state = AppState::new(config, store, registered_task_names());
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}

async fn worker(config: AppConfig) -> anyhow::Result<()> {
    let store = build_store(&config, false).await?;
    let registry = Arc::new(TaskRegistry::builtin());

    let workspace_base = std::env::var("WORKSPACE_BASE")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            if config.env.is_dev() {
                std::env::temp_dir().join("velu-workspace")
            } else {
                PathBuf::from("/workspace")
            }
        });

    let mut worker_config = WorkerConfig::new(WorkerConfig::default_worker_id(), workspace_base);
    worker_config.lease_seconds = config.lease_seconds;
    worker_config.require_org = config.store_credentials;
    worker_config.test_mode = config.env == Env::Test;
    worker_config.hold_after_claim = std::env::var("VELU_DEBUG_HOLD_AFTER_CLAIM_SEC")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|&s| s > 0)
        .map(Duration::from_secs);

    tracing::info!(worker_id = %worker_config.worker_id, "worker starting");
    Worker::new(store, registry, worker_config).run().await;
    Ok(())
}

async fn migrate(config: AppConfig) -> anyhow::Result<()> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is required to migrate")?;
    migrations::migrate(url).await?;
    tracing::info!("migrations applied");
    Ok(())
}
