use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use llamafleet::config::ConfigStore;
use llamafleet::download::DownloadManager;
use llamafleet::manager::Manager;
use llamafleet::state::AppState;
use llamafleet::web;

#[derive(Parser, Debug)]
#[command(name = "llamafleet")]
#[command(about = "Supervisor and web control plane for a fleet of llama-server instances")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Arc::new(
        ConfigStore::load(&args.config)
            .with_context(|| format!("failed to load config from {}", args.config.display()))?,
    );
    info!(
        "loaded {} instance(s) from {}",
        config.instances().len(),
        args.config.display()
    );

    let manager = Manager::new(config.clone());
    manager.start_all();

    let downloads = Arc::new(DownloadManager::new(config.server_bin()));
    let state = Arc::new(AppState {
        config: config.clone(),
        manager: manager.clone(),
        downloads,
    });

    let port = config.manager_port();
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!("web UI available at http://localhost:{port}");

    axum::serve(listener, web::router(state))
        .with_graceful_shutdown(shutdown_signal(manager))
        .await
        .context("http server error")?;

    Ok(())
}

/// Resolve on SIGINT or SIGTERM, after the manager has wound down every
/// supervised child.
async fn shutdown_signal(manager: Arc<Manager>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
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

    info!("received shutdown signal");
    manager.shutdown().await;
}
