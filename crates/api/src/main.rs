//! Digest status API binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use digest_common::clock::SystemClock;
use digest_common::config::AppConfig;
use digest_common::db::create_pool;
use digest_engine::PgStore;

use digest_api::routes::create_router;
use digest_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("digest_api=debug,digest_engine=info,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting digest status API...");

    // Load configuration
    let config = AppConfig::from_env()?;

    // Create database connection pool
    let pool = create_pool(&config).await?;

    // Build application state
    let state = AppState::new(Arc::new(PgStore::new(pool)), Arc::new(SystemClock));

    // Build router
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    Ok(())
}
