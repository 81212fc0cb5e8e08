//! Colloquy Gateway - Session-scoped chat over HTTP.
//!
//! This crate provides the chat service:
//! - Explicit session creation and ordered message history
//! - Request/response and NDJSON streaming turns against a model provider
//! - Ollama and OpenAI providers with retry and backoff
//!
//! ## Architecture
//!
//! ```text
//! Client → routes → Orchestrator → Provider (Ollama / OpenAI)
//!                        ↓
//!                  colloquy-store (SQLite)
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod error;
pub mod orchestrator;
pub mod provider;
pub mod routes;
pub mod stream;

pub use error::{ChatError, ErrorResponse};
pub use orchestrator::{Orchestrator, TurnOutcome, TurnSettings, TurnStream};
pub use provider::{
    create_provider, ChatMessage, ChatRequest, ChatResponse, FragmentStream, OllamaProvider,
    OpenAIProvider, Provider, ProviderError, ResilienceConfig, ResilientProvider,
};
pub use routes::{AppState, HealthResponse};
pub use stream::{StreamUnit, NDJSON_CONTENT_TYPE};

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::{self, Next},
    response::Response,
    Router,
};
use colloquy_common::config::{Config, ServerConfig};
use colloquy_common::logging::{generate_trace_id, TRACE_ID_HEADER};
use colloquy_common::request_span;
use colloquy_store::{PoolConfig, SqliteStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Instrument;

/// Build the gateway router with all routes and middleware.
pub fn build_router(state: AppState, server: &ServerConfig) -> Router {
    Router::new()
        .merge(routes::chat_routes(state))
        .merge(routes::health_routes())
        .layer(middleware::from_fn(trace_requests))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(server))
}

fn cors_layer(server: &ServerConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = server
        .cors_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin.trim()).ok())
        .collect();

    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        cors.allow_origin(AllowOrigin::list(origins))
    }
}

/// Attach a trace id to each request's span and echo it on the response.
async fn trace_requests(request: Request, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get(TRACE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(generate_trace_id);

    let span = request_span!(
        "http_request",
        trace_id,
        method = %request.method(),
        path = %request.uri().path()
    );
    let mut response = next.run(request).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&trace_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(TRACE_ID_HEADER), value);
    }
    response
}

/// Open the store and the model provider described by `config`.
pub fn build_app(config: &Config) -> anyhow::Result<AppState> {
    let db_path = config.storage.resolved_db_path();
    let pool = PoolConfig {
        max_size: config.storage.pool_size,
        busy_timeout: Duration::from_millis(config.storage.busy_timeout_ms),
    };
    let store = SqliteStore::open(&db_path, pool)?
        .with_session_ttl(config.chat.session_ttl_secs.map(Duration::from_secs));
    tracing::info!(db_path = %db_path.display(), "Conversation store opened");

    let provider = create_provider(&config.model);
    let orchestrator = Orchestrator::new(Arc::new(store), provider, TurnSettings::from_config(config));
    Ok(AppState::new(orchestrator))
}

/// Start the gateway server.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>()?,
        config.server.port,
    ));

    let router = build_router(build_app(config)?, &config.server);

    tracing::info!("Starting Colloquy Gateway on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Colloquy Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
