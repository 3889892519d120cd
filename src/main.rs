//! SSE demo server - Binary Entry Point
//!
//! Serves the demo event endpoints until Ctrl-C, then closes every
//! subscriber so clients see a clean end of stream.

use std::sync::Arc;

use sse_engine::server::{create_router, spawn_heartbeat, AppState};
use sse_engine::{ServerConfig, NAME, VERSION};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = ServerConfig::from_env()?;
    let state = Arc::new(AppState::new(&config));

    let heartbeat = config
        .keep_alive
        .map(|interval| spawn_heartbeat(Arc::clone(&state), interval));

    let app = create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let addr = listener.local_addr()?;
    info!(name = NAME, version = VERSION, %addr, "Listening");

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            info!("Shutting down");
            shutdown_state.messages.close_all().await;
        })
        .await?;

    if let Some(heartbeat) = heartbeat {
        heartbeat.abort();
    }
    Ok(())
}
