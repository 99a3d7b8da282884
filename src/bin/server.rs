//! polylogue HTTP server binary.
//!
//! Wires the engine to an OpenAI-compatible backend pair and a SQLite
//! store, then serves the lifecycle and query routes.
//!
//! # Environment Variables
//!
//! - `PORT` — HTTP port (default: 8080)
//! - `POLYLOGUE_DB` — SQLite path (default: `polylogue.db`)
//! - `POLYLOGUE_BASE_URL` — backend base URL (default: api.openai.com)
//! - `OPENAI_API_KEY` — bearer token for the backend
//! - `RUST_LOG` — tracing filter (default: "info")

use std::path::PathBuf;
use std::sync::Arc;

use polylogue::backend::openai::{OpenAiConfig, OpenAiProvider};
use polylogue::config::EngineConfig;
use polylogue::engine::DialogueEngine;
use polylogue::recorder::SqliteStore;
use polylogue::server::{app_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,polylogue=debug".into()),
        )
        .init();

    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let bind_addr = format!("0.0.0.0:{port}");

    let db_path = std::env::var("POLYLOGUE_DB").unwrap_or_else(|_| "polylogue.db".to_string());
    let store = Arc::new(SqliteStore::new(PathBuf::from(db_path))?);

    let mut backend_config = OpenAiConfig::default();
    if let Ok(base_url) = std::env::var("POLYLOGUE_BASE_URL") {
        backend_config.base_url = base_url;
    }
    let provider = Arc::new(OpenAiProvider::new(backend_config)?);

    let engine = Arc::new(DialogueEngine::new(
        EngineConfig::default(),
        provider.clone(),
        provider,
        store,
    ));
    let app = app_router(AppState::new(engine));

    tracing::info!("polylogue server starting on {bind_addr}");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
