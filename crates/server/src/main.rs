use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use coscribe_server::config::ServerConfig;
use coscribe_server::generation::{GenerationBackend, HttpGenerationBackend, UnconfiguredBackend};
use coscribe_server::registry::SessionRegistry;
use coscribe_server::session::SessionContext;
use coscribe_server::store::SnapshotStore;
use coscribe_server::ws::{router, AppState};

/// Coscribe collaboration server.
#[derive(Debug, Parser)]
#[command(name = "coscribe-server", version)]
struct Args {
    /// Config file path (defaults to ~/.coscribe/coscribe.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured listen address.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => ServerConfig::load_from(path)?,
        None => ServerConfig::load(),
    };
    let bind_addr = args.bind.unwrap_or_else(|| config.bind_addr.clone());

    let data_dir = config.resolved_data_dir()?;
    let store = Arc::new(
        SnapshotStore::new(&data_dir)
            .with_context(|| format!("failed to open snapshot store in `{}`", data_dir.display()))?,
    );

    let backend: Arc<dyn GenerationBackend> = match &config.generation.endpoint {
        Some(endpoint) => {
            info!(endpoint = %endpoint, "using HTTP generation backend");
            Arc::new(HttpGenerationBackend::new(endpoint.clone(), config.generation.model.clone()))
        }
        None => {
            info!("no generation endpoint configured; AI queries will fail cleanly");
            Arc::new(UnconfiguredBackend)
        }
    };

    let registry =
        SessionRegistry::new(SessionContext { store, backend, timings: config.timings() });
    let app = router(AppState { registry: registry.clone() });

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {bind_addr}"))?;

    info!(listen_addr = %bind_addr, "starting coscribe server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited unexpectedly")?;

    // Flush every open document before the process ends.
    registry.shutdown_all().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
