// HTTP server module
//
// The outer surface: chat, session CRUD, and evolution submit/poll/cancel.
// Authentication, rate limiting, and CORS live here; the core components
// never see them.

mod handlers;
mod middleware;
mod types;

pub use middleware::{auth_middleware, rate_limit_middleware, RateLimiter};
pub use types::{
    ApiError, ChatRequest, ChatResponse, ErrorBody, EvolveAccepted, EvolveRequest, HealthResponse,
    SessionCreateRequest,
};

use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{Config, EvolveConfig, ToolConfig};
use crate::gateway::Gateway;
use crate::registry::TaskRegistry;
use crate::session::SessionStore;

/// Idle rate-limiter buckets older than this are purged periodically.
const BUCKET_PURGE_IDLE_SECS: u64 = 600;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub sessions: Arc<SessionStore>,
    pub registry: Arc<TaskRegistry>,
    pub tool: Arc<ToolConfig>,
    pub evolve: Arc<EvolveConfig>,
    pub rate_limiter: RateLimiter,
    pub auth_enabled: bool,
    pub api_keys: Arc<Vec<String>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: &Config,
        gateway: Arc<Gateway>,
        sessions: Arc<SessionStore>,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            gateway,
            sessions,
            registry,
            tool: Arc::new(config.tool.clone()),
            evolve: Arc::new(config.evolve.clone()),
            rate_limiter: RateLimiter::new(
                config.server.requests_per_second,
                config.server.burst,
            ),
            auth_enabled: config.server.auth_enabled,
            api_keys: Arc::new(config.server.api_keys.clone()),
            started_at: Instant::now(),
        }
    }
}

/// Assemble the router. Health stays outside the auth and rate-limit layers.
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/v1/chat", post(handlers::handle_chat))
        .route(
            "/v1/sessions",
            post(handlers::create_session).get(handlers::list_sessions),
        )
        .route(
            "/v1/sessions/:id",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        .route(
            "/v1/evolve",
            post(handlers::submit_evolution).get(handlers::list_evolutions),
        )
        .route(
            "/v1/evolve/:id",
            get(handlers::get_evolution).delete(handlers::remove_evolution),
        )
        .route("/v1/evolve/:id/cancel", post(handlers::cancel_evolution))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(handlers::health_check))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: AppState, bind_address: &str) -> Result<()> {
    let addr: SocketAddr = bind_address.parse()?;

    // Keep the per-IP bucket table bounded.
    let limiter = state.rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            limiter.purge_idle(BUCKET_PURGE_IDLE_SECS);
        }
    });

    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "server listening");
    axum::serve(listener, router).await?;
    Ok(())
}
