//! ondevice-session server binary.
//!
//! Loads configuration, resolves the engine backend, optionally preloads a model
//! into a session and serves the HTTP API.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use ondevice_session::config::{Cli, Config};
use ondevice_session::engine;
use ondevice_session::server::http_api::{build_router, AppState};
use ondevice_session::session::SessionManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "ondevice_session=debug,tower_http=debug"
    } else {
        "ondevice_session=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        target = env!("ONDEVICE_TARGET"),
        "ondevice-session starting"
    );

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    let config = Arc::new(config);

    info!(
        n_ctx = config.session.context_length,
        n_batch = config.session.batch_size,
        cache_k = %config.session.cache_type_k,
        cache_v = %config.session.cache_type_v,
        threads = config.session.effective_threads(),
        "Configuration loaded"
    );

    let backend = engine::backend();
    let manager = Arc::new(SessionManager::new(backend, config.snapshot.clone())?);

    if let Some(model) = &cli.model {
        let mut report = |p: ondevice_session::session::LoadProgress| {
            if p.is_error {
                warn!(status = %p.status, "Model load failed");
            } else {
                info!(fraction = p.fraction, status = %p.status, "Loading model");
            }
        };
        let session =
            manager.create_session_with_progress(model, config.session.clone(), &mut report)?;
        info!(session_id = %session.id(), model = %model.display(), "Preloaded session");
    }

    // Build the HTTP router.
    let state = Arc::new(AppState::new(manager.clone(), config.clone()));
    let app = build_router(state);

    // Start the server.
    let listen_addr = config.server.listen.clone();
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    let left = manager.shutdown();
    if left > 0 {
        warn!(sessions = left, "Sessions still busy at shutdown");
    }
    Ok(())
}
