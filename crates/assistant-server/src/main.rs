mod configuration;
mod error;
mod routes;
mod state;

use std::sync::Arc;

use assistant::providers::factory;
use assistant::service::Assistant;
use assistant::storage::{JsonFileStore, MemoryStore, Store};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging, RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let settings = configuration::Settings::new()?;
    let provider_type = settings.provider.provider_type();
    let provider = factory::get_provider(settings.provider.into_config())?;

    let store: Arc<dyn Store> = match &settings.storage.data_dir {
        Some(dir) => Arc::new(JsonFileStore::new(dir)?),
        None => {
            warn!("no storage directory configured, tools and servers will not persist");
            Arc::new(MemoryStore::new())
        }
    };

    let assistant = Arc::new(Assistant::new(
        provider,
        store,
        settings.agent.into_config(),
        settings.mcp.into_settings(),
    ));
    assistant.start().await?;

    // Bring remote tools up to date without holding up the listener
    let syncing = assistant.clone();
    tokio::spawn(async move {
        if let Err(e) = syncing.sync_tools().await {
            warn!("initial tool sync failed: {}", e);
        }
    });

    // Create router with CORS support
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::configure(state::AppState::new(assistant.clone())).layer(cors);

    let listener = tokio::net::TcpListener::bind(settings.server.socket_addr()?).await?;
    info!(provider = %provider_type, "listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    info!("shutting down tool servers");
    assistant.shutdown().await;
    Ok(())
}
