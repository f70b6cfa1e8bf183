use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use file_lifecycle::{
    api, config::Config, object_store::StoreSet, storage::Database, transfer::HttpFetcher,
    uploads::allow_content_types, AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "gcp" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_stackdriver::layer())
                .init();
        }
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "file-lifecycle starting");

    // Load configuration
    let config = Config::load()?;

    // Initialize database
    let db = Database::open(&config.node.data_dir)?;
    info!("Database opened at: {}", config.node.data_dir);

    // Initialize store adapters, in preference order
    let stores = StoreSet::from_config(&config.storage.stores)?;
    for adapter in stores.iter() {
        info!(
            store = %adapter.name(),
            acl = adapter.acl().as_str(),
            required = adapter.is_required(),
            "Configured store"
        );
    }

    let fetcher = HttpFetcher::new(config.transfer.fetch_timeout, config.max_upload_size)?;
    let admission = allow_content_types(config.uploads.allowed_types.clone());
    let sweep_interval = config.uploads.sweep_interval;
    let bind_address = config.node.bind_address.clone();

    // Create shared state
    let (state, upload_events) = AppState::new(config, db, stores, Arc::new(fetcher), admission)?;

    // Start background work: transfers and the expired-upload sweeper
    let requeued = state.pool.start(upload_events)?;
    info!(requeued, "Transfer pool started");

    let sweeper_cancel = CancellationToken::new();
    let sweeper = state
        .temp
        .spawn_sweeper(sweep_interval, sweeper_cancel.clone());

    // Build and start the HTTP server
    let app = api::create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!("Listening on: {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Cleanup: stop background tasks
    info!("Shutting down background tasks");
    sweeper_cancel.cancel();
    if let Err(e) = sweeper.await {
        tracing::error!(error = %e, "Upload sweeper did not stop cleanly");
    }
    state.pool.stop().await;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}
