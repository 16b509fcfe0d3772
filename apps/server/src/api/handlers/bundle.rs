//! Batch and transaction bundle handler

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value as JsonValue;

use crate::{
    api::headers::{build_base_url_from_headers, extract_prefer_return},
    services::bundle::{BundleProcessor, BundleRequestOptions},
    state::AppState,
    Error, Result,
};

/// Handle batch and transaction bundle POST requests (POST /fhir)
///
/// A transaction answers with a `transaction-response` or a single
/// OperationOutcome; a batch always answers `200` with one entry per request.
pub async fn batch_transaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    tracing::info!(size_bytes = body.len(), "Received batch/transaction request");

    let bundle: JsonValue = serde_json::from_slice(&body)
        .map_err(|e| Error::InvalidResource(format!("Request body is not valid JSON: {}", e)))?;

    let options = BundleRequestOptions {
        prefer_return: extract_prefer_return(&headers)
            .unwrap_or_else(|| state.config.default_prefer_return()),
        base_url: Some(
            state
                .config
                .fhir
                .base_url
                .clone()
                .unwrap_or_else(|| build_base_url_from_headers(&headers)),
        ),
    };

    let response_bundle = BundleProcessor::from_state(&state)
        .process(bundle, &options)
        .await?;

    let mut response = (StatusCode::OK, Json(response_bundle)).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/fhir+json; charset=utf-8"),
    );
    Ok(response)
}
