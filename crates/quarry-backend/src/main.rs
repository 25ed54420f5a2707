use clap::Parser;
use quarry_core::{Clock, QuarryConfig};
use quarry_workers::{WorkerContext, WorkerPool, WorkerRegistry};
use tracing::{info, warn};

/// Quarry backend: runs queued jobs until interrupted.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to quarry.toml
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quarry_backend=info,quarry_workers=info".into()),
        )
        .init();

    let args = Args::parse();

    // load config: --config > QUARRY_CONFIG env > ~/.quarry/quarry.toml
    let config_path = args.config.or_else(|| std::env::var("QUARRY_CONFIG").ok());
    let config = QuarryConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        QuarryConfig::default()
    });

    let ctx = WorkerContext::open(config, Clock::System)?;
    let registry = WorkerRegistry::builtin(&ctx);
    info!(workers = registry.len(), "worker types registered");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let pool = tokio::spawn(WorkerPool::new(ctx, registry).run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    let _ = shutdown_tx.send(true);
    pool.await?;
    Ok(())
}
