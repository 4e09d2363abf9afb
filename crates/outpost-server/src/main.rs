mod auth;
mod config;
mod error;
mod rate_limit;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use config::AppConfig;
use outpost_core::models::{NodeRole, SchemaRegistry};
use outpost_core::sync::{SyncHub, TokenIssuer};
use outpost_core::{DatabaseService, SyncContext};
use routes::{app_router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("outpost_server=info".parse()?)
                .add_directive("outpost_core=info".parse()?),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("Starting outpost-server with config: {:?}", config);

    let schema = SchemaRegistry::load(&config.schema_path)?;
    let db = DatabaseService::open_path(config.db_path.clone()).await?;
    let ctx = SyncContext::new(db, schema, config.sync.clone(), NodeRole::Server);
    let tokens = TokenIssuer::new(&config.token_secret, config.token_ttl)?;
    let hub = SyncHub::start(ctx, tokens, &config.server_code, &config.server_name).await?;

    let state = AppState::new(config, hub);
    let bind_addr = state.config.bind_addr.clone();
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("outpost-server listening on {}", bind_addr);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("outpost-server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {error}");
        std::future::pending::<()>().await;
    }
}
