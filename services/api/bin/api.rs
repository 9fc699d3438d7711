//! Main Entrypoint for the SignBridge API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Building the sign index from the asset directory.
//! 3. Selecting the recognition provider.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use signbridge_api::{
    config::{Config, Provider},
    router::create_router,
    state::AppState,
};
use signbridge_core::{
    lookup::SignIndex,
    provider::{ConstantProvider, HttpProvider, RecognitionProvider},
};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// Listens for the `Ctrl+C` signal, then tells every live session to close.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
    }
    info!("Received shutdown signal. Shutting down gracefully...");
    let _ = shutdown_tx.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Build the Sign Index ---
    let sign_index = SignIndex::build(&config.signs_dir, &config.signs_url_prefix)
        .with_context(|| format!("Failed to index sign assets in {:?}", config.signs_dir))?;
    info!(
        indexed_signs = sign_index.len(),
        signs_dir = ?config.signs_dir,
        "Sign index built."
    );

    // --- 4. Initialize the Recognition Provider ---
    let provider: Arc<dyn RecognitionProvider> = match &config.provider {
        Provider::Constant => {
            info!(label = %config.constant_label, "Using constant recognition provider.");
            Arc::new(ConstantProvider::new(config.constant_label.clone()))
        }
        Provider::Http => {
            let url = config
                .inference_url
                .as_deref()
                .context("INFERENCE_URL is required for the http provider")?;
            info!(%url, "Using HTTP recognition provider.");
            Arc::new(HttpProvider::new(url, config.dispatch.inference_timeout)?)
        }
    };

    info!(provider = provider.name(), "Recognition provider ready.");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let app_state = Arc::new(AppState::new(
        config.clone(),
        sign_index,
        provider,
        shutdown_rx,
    ));

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(Arc::clone(&app_state)).layer(cors);

    // --- 6. Start Server ---
    info!(
        provider = ?config.provider,
        limits = ?config.dispatch,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_tx))
    .await?;

    let closed = app_state.sessions.disconnect_all();
    info!(closed, "Server has shut down.");
    Ok(())
}
