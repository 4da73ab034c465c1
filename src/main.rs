mod config;
mod db;
mod routes;
mod state;
mod store;
mod ws;

use std::sync::Arc;

use tokio::net::TcpListener;

use config::{generate_config_template, Config};
use store::SqliteChatStore;
use ws::ConnectionRegistry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "portal_chat_server=info".parse().unwrap()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "portal_chat_server=info".parse().unwrap()),
            )
            .init();
    }

    tracing::info!("portal-chat-server v{} starting", env!("CARGO_PKG_VERSION"));

    // Initialize SQLite database and the persistence gateway
    let db = db::init_db(&config.data_dir)?;

    let state = state::AppState {
        store: Arc::new(SqliteChatStore::new(db)),
        registry: Arc::new(ConnectionRegistry::new()),
    };

    // Build router, bind and serve
    let app = routes::build_router(state);

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
