use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tracing::info;
use tracing_subscriber::prelude::*;

mod auth;
mod backplane;
mod bootstrap;
mod broadcast;
mod config;
mod coordinator;
mod db;
mod error;
mod handlers;
mod identity;
mod metrics;
mod registry;
mod repository;
mod store;
mod ws;


pub(crate) use bootstrap::AppState;

use crate::backplane::{Backplane, MemoryBackplane, RedisBackplane};
use crate::bootstrap::{Instance, Stores};
use crate::config::{BackplaneKind, FileConfig, HubConfig};

#[derive(Parser)]
#[command(name = "presence-hub")]
#[command(about = "Presence and status fanout across a fleet of WebSocket servers")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// TOML config file, layered under PRESENCE_* environment variables
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub in the foreground (default)
    Serve,

    /// Print the resolved configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let file_config: FileConfig = config::load_config(cli.config.as_deref())
        .extract()
        .context("Failed to load configuration")?;

    match cli.command {
        Some(Commands::Config) => {
            let mut shown = file_config;
            if shown.auth.jwt_secret.is_some() {
                shown.auth.jwt_secret = Some("<redacted>".to_string());
            }
            print!("{}", toml::to_string_pretty(&shown)?);
            Ok(())
        }
        None | Some(Commands::Serve) => run_server(file_config, cli.debug).await,
    }
}

fn init_tracing(debug: bool) {
    let default_directive = if debug {
        "presence_hub=debug,tower_http=debug,info"
    } else {
        "presence_hub=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

async fn run_server(file_config: FileConfig, debug: bool) -> Result<()> {
    init_tracing(debug);

    let config = HubConfig::from_file(&file_config)?;
    info!("Starting presence hub");
    info!(
        backplane = ?config.backplane.kind,
        store = ?config.store.kind,
        auth = ?config.auth,
        "Configuration loaded"
    );

    let backplane: Arc<dyn Backplane> = match config.backplane.kind {
        BackplaneKind::Redis => Arc::new(
            RedisBackplane::open(&config.backplane.url)
                .with_context(|| format!("Invalid backplane url: {}", config.backplane.url))?,
        ),
        BackplaneKind::Memory => {
            info!("Using in-process backplane; fanout stays on this instance");
            Arc::new(MemoryBackplane::new())
        }
    };

    let stores = Stores::open(&config.store).await?;
    let instance = Arc::new(Instance::start(&config, backplane, stores).await?);
    let app = instance.router();

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    let actual_addr = listener.local_addr()?;

    info!(
        instance = %instance.identity().name,
        "Presence hub listening on http://{}", actual_addr
    );
    info!("  GET    /ws             - Presence WebSocket");
    info!("  POST   /signup, /login - Accounts");
    info!("  POST   /data           - Create a record");
    info!("  PUT    /updatestatus   - Update status");
    info!("  GET    /health/ready   - Readiness probe");

    // Create shutdown signal handler. Open sockets are closed here so the
    // server is not left waiting on them.
    let closing = instance.clone();
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
        closing.shutdown().await;
    };

    // Run server with graceful shutdown
    let server_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    .context("Server error");

    info!("Shutdown complete");
    server_result
}
