//! Gateway binary: loads configuration, wires the singletons and serves.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use troupe_core::{TroupeConfig, TroupeResult};
use troupe_cost::{InMemoryUsageStore, SqliteUsageStore, UsageStore};
use troupe_gateway::{build_gate, build_router, AppState};

#[derive(Parser)]
#[command(name = "troupe-gateway", about = "Multi-agent orchestration gateway", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "troupe.toml")]
    config: PathBuf,

    /// Listen address (overrides config).
    #[arg(short, long)]
    listen: Option<String>,

    /// SQLite usage database path; accounting is in-memory when omitted.
    #[arg(long)]
    db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> TroupeResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        TroupeConfig::load(&cli.config)?
    } else {
        info!(path = %cli.config.display(), "No config file, using defaults");
        let mut config = TroupeConfig::default();
        config.apply_env_overrides();
        config
    };
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    let store: Arc<dyn UsageStore> = match &cli.db {
        Some(path) => {
            info!(path = %path.display(), "Using SQLite usage store");
            Arc::new(SqliteUsageStore::open(path)?)
        }
        None => Arc::new(InMemoryUsageStore::new()),
    };

    let state = AppState::from_config(&config, store)?;
    let gate = build_gate(&config, state.limiter.clone());
    let _sweeper = state.limiter.spawn_sweeper();

    let app = build_router(state, gate);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Gateway listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
