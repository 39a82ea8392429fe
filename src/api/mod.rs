//! API layer - HTTP handlers and routing
//!
//! - Account and session endpoints under `/api`
//! - Liveness check at `/health`

pub mod auth;
pub mod middleware;

use anyhow::{Context, Result};
use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub use middleware::{ApiError, AppState};

/// Build the main API router
pub fn build_api_router() -> Router<AppState> {
    auth::router()
}

/// Build the complete router with middleware
pub fn build_router(state: AppState, cors_origin: &str) -> Result<Router> {
    let cors = cors_layer(cors_origin)?;

    Ok(Router::new()
        .nest("/api", build_api_router())
        .route("/health", get(health))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state))
}

/// GET /health
async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

fn cors_layer(origin: &str) -> Result<CorsLayer> {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(middleware::SESSION_TOKEN_HEADER),
        ]);

    if origin == "*" {
        return Ok(cors.allow_origin(Any));
    }

    let origin = origin
        .parse::<HeaderValue>()
        .with_context(|| format!("Invalid CORS origin: {}", origin))?;
    Ok(cors.allow_origin(origin))
}
