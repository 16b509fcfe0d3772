//! Route tables

use axum::{
    routing::{get, post},
    Router,
};

use crate::api::handlers;
use crate::state::AppState;

/// `POST /fhir` accepts batch and transaction bundles
pub fn fhir_routes() -> Router<AppState> {
    Router::new().route("/", post(handlers::bundle::batch_transaction))
}

pub fn metrics_routes() -> Router<AppState> {
    Router::new().route("/metrics", get(handlers::metrics::metrics_handler))
}
