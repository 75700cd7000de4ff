// Declare the modules
pub mod api;
pub mod chat;
pub mod config;
pub mod errors;
pub mod models;
pub mod routes;
pub mod state;
pub mod storage;

use crate::api::{ChatClient, LLMApiProvider, OpenAICompatibleProvider};
use anyhow::Context;
use config::Config;
use state::AppState;
use std::sync::Arc;
use storage::StorageManager;

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
    }
    log::info!("Shutdown signal received");
}

pub async fn run() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env()?;
    let storage_manager = StorageManager::new(&config.database_url).await?;

    // Create the API provider instance
    let api_provider: Arc<dyn LLMApiProvider> = Arc::new(OpenAICompatibleProvider::new(
        config.api_url.clone(),
        config.api_key.clone(),
    ));
    let app_state = AppState::new(storage_manager, ChatClient::new(api_provider));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    log::info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, routes::router(app_state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;
    Ok(())
}
