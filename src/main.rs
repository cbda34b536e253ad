use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use turnstile_solver::{
    install_prometheus, load_config, serve, setup_logging, AppState, BrowserPool,
    ChallengeSolver, ChromiumProvider, Cli, JsonFileBackend, TaskStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let config = load_config(&args).await?;

    setup_logging(config.debug)?;

    info!("Starting turnstile-solver v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded successfully");
    info!("Browser pool size: {}", config.browser_pool_size);
    info!("Browser type: {:?} (headless: {})", config.browser_type, config.headless);
    if config.proxy_support {
        info!("Proxy file fallback enabled: {}", config.proxy_file);
    }
    info!("Results file: {}", config.results_file);

    let metrics = if config.metrics {
        Some(
            install_prometheus()
                .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {e}"))?,
        )
    } else {
        None
    };

    info!("Initializing browser pool with {} browsers", config.browser_pool_size);
    let provider = ChromiumProvider::new(config.clone());
    let pool = match BrowserPool::initialize(config.browser_pool_size, &provider).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Browser pool could not be started: {}", e);
            return Err(e.into());
        }
    };

    let backend = Arc::new(JsonFileBackend::new(&config.results_file));
    let store = Arc::new(TaskStore::load(backend).await);
    let solver = Arc::new(ChallengeSolver::from_config(pool.clone(), store.clone(), &config));
    let state = Arc::new(AppState::new(solver).with_metrics(metrics));

    let listener = TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address()))?;

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx);
    let shutdown = async move {
        let _ = shutdown_rx.recv().await;
        info!("Received shutdown signal");
    };

    let result = serve(listener, state, shutdown).await;

    info!("Shutting down...");
    if let Err(e) = store.persist().await {
        warn!("Final save of results failed: {}", e);
    }
    pool.shutdown().await;

    result.context("HTTP server error")?;
    info!("turnstile-solver stopped");
    Ok(())
}

fn setup_shutdown_handler(
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let sigint = signal::unix::signal(signal::unix::SignalKind::interrupt());
        let sigterm = signal::unix::signal(signal::unix::SignalKind::terminate());

        match (sigint, sigterm) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {
                        info!("Received SIGINT");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM");
                    }
                }
            }
            _ => {
                warn!("Unix signal handlers unavailable, waiting for Ctrl+C");
                if let Err(e) = signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl+C: {}", e);
                    return;
                }
            }
        }

        let _ = shutdown_tx.send(());
    })
}
