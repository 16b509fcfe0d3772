//! HTTP surface: routes, handlers, and middleware

pub mod handlers;
pub mod headers;
pub mod middleware;
pub mod routes;

use axum::{extract::DefaultBodyLimit, routing::get, Router};

use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    let max_body_size = state.config.server.max_request_body_size;
    let cors_origins = state.config.server.cors_origins.clone();

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .merge(routes::metrics_routes())
        .nest("/fhir", routes::fhir_routes())
        .with_state(state)
        // Applied in reverse order
        .layer(axum::middleware::from_fn(
            middleware::security_headers_middleware,
        ))
        .layer(middleware::cors(&cors_origins))
        .layer(middleware::trace())
        .layer(DefaultBodyLimit::max(max_body_size))
}
