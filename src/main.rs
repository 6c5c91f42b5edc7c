//! Todu Sync Server
//!
//! Authoritative record store for offline-first Todu Fit clients. Clients
//! queue edits locally and post them here one at a time; the server checks
//! each edit's base version, applies it, and remembers its id so retries
//! are answered without applying twice.
//!
//! # Configuration
//!
//! Environment variables:
//! - `TODU_SYNC_PORT`: Port to listen on (default: 8080)
//! - `TODU_SYNC_DATA_DIR`: Directory for records.json (default: ~/.local/share/todu-sync-server)
//! - `TODU_SYNC_CONFIG`: Path to config file (default: ~/.config/todu-sync-server/config.yaml)
//!
//! # Config File Format
//!
//! ```yaml
//! api_keys:
//!   - key: "your-secret-key-here"
//!     user_id: "alice"
//! ```

mod auth;
mod routes;
mod storage;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use auth::ApiKeyStore;
use routes::{build_router, AppState};
use storage::RecordStore;

const APP_DIR: &str = "todu-sync-server";

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
struct Config {
    port: u16,
    data_dir: PathBuf,
    config_path: PathBuf,
}

impl Config {
    fn from_env() -> Self {
        let port = std::env::var("TODU_SYNC_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let data_dir = std::env::var("TODU_SYNC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(APP_DIR)
            });

        let config_path = std::env::var("TODU_SYNC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(APP_DIR)
                    .join("config.yaml")
            });

        Self {
            port,
            data_dir,
            config_path,
        }
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "todu_sync_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run(Config::from_env()).await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&config.data_dir)?;
    tracing::info!("Data directory: {}", config.data_dir.display());
    tracing::info!("Config file: {}", config.config_path.display());

    let records = Arc::new(RecordStore::open(&config.data_dir)?);
    tracing::info!("Serving {} record(s)", records.record_count());
    let state = AppState {
        api_keys: Arc::new(ApiKeyStore::load(&config.config_path)),
        records,
    };
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
