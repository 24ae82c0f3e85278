//! Ponder - streaming chat service for reasoning models
//!
//! Streams responses from hosted model providers to the client as
//! server-sent events, keeping each model's thinking apart from its answer,
//! and holds a token-bounded conversation history per session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod conversation;
mod core;
mod providers;
mod routes;

use crate::config::{Config, Credentials, ModelCatalog, TokenizerKind};
use crate::core::{TiktokenCounter, TokenCounter, WordCounter};
use crate::routes::SessionStore;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub catalog: Arc<ModelCatalog>,
    pub credentials: Arc<Credentials>,
    pub counter: Arc<dyn TokenCounter>,
    pub sessions: SessionStore,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ponder_chat=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let catalog = config.load_catalog()?;
    let credentials = Credentials::from_env(&catalog);
    tracing::info!(
        "Loaded {} models, credentials present: {:?}",
        catalog.entries().count(),
        credentials.available()
    );

    // Fail at startup rather than on the first session
    catalog.model(&config.default_model)?;

    let counter: Arc<dyn TokenCounter> = match config.tokenizer {
        TokenizerKind::Tiktoken => Arc::new(TiktokenCounter::new()?),
        TokenizerKind::Words => Arc::new(WordCounter),
    };

    let sessions = SessionStore::new();
    let max_idle = Duration::from_secs(config.session_idle_secs);
    sessions.spawn_reaper(max_idle, (max_idle / 4).max(Duration::from_secs(1)));

    let state = AppState {
        config: Arc::new(config),
        catalog: Arc::new(catalog),
        credentials: Arc::new(credentials),
        counter,
        sessions,
    };

    let app = Router::new()
        .merge(routes::router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!("Ponder API running at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
