pub mod assertions;
pub mod builders;

use anyhow::Context as _;
use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode},
    Router,
};
use futures::FutureExt as _;
use serde_json::Value;
use std::sync::Arc;
use tessera::{api::create_router, payload::InMemoryPayloadStore, AppState, Config};
use tower::ServiceExt as _;

pub use assertions::*;
pub use builders::*;

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub payloads: Arc<InMemoryPayloadStore>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::new_with_config(|_| {})
    }

    pub fn new_with_config(configure: impl FnOnce(&mut Config)) -> Self {
        let mut config = Config::default();
        configure(&mut config);

        let payloads = Arc::new(InMemoryPayloadStore::new());
        let state = AppState::with_payload_store(config, payloads.clone());
        let router = create_router(state.clone());

        Self {
            router,
            state,
            payloads,
        }
    }

    pub async fn request(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<Bytes>,
    ) -> anyhow::Result<(StatusCode, HeaderMap, Bytes)> {
        self.request_with_extra_headers(method, path_and_query, body, &[])
            .await
    }

    pub async fn request_with_extra_headers(
        &self,
        method: Method,
        path_and_query: &str,
        body: Option<Bytes>,
        extra_headers: &[(&str, &str)],
    ) -> anyhow::Result<(StatusCode, HeaderMap, Bytes)> {
        let mut request = Request::builder()
            .method(method)
            .uri(path_and_query)
            .header("host", "example.org")
            .header("accept", "application/fhir+json")
            .header("content-type", "application/fhir+json")
            .body(match body {
                Some(bytes) => Body::from(bytes),
                None => Body::empty(),
            })
            .context("build request")?;

        for (name, value) in extra_headers {
            request.headers_mut().insert(
                name.parse::<HeaderName>().context("parse header name")?,
                value.parse::<HeaderValue>().context("parse header value")?,
            );
        }

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .context("dispatch request")?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .context("read response body")?;

        Ok((status, headers, body))
    }

    /// POST a bundle to `/fhir` and parse the JSON answer.
    pub async fn post_bundle(&self, bundle: &Value) -> anyhow::Result<(StatusCode, Value)> {
        self.post_bundle_with_headers(bundle, &[]).await
    }

    pub async fn post_bundle_with_headers(
        &self,
        bundle: &Value,
        extra_headers: &[(&str, &str)],
    ) -> anyhow::Result<(StatusCode, Value)> {
        let (status, _headers, body) = self
            .request_with_extra_headers(
                Method::POST,
                "/fhir",
                Some(to_json_body(bundle)?),
                extra_headers,
            )
            .await?;
        let json = serde_json::from_slice(&body).context("response body is JSON")?;
        Ok((status, json))
    }
}

pub async fn with_test_app<F>(f: F) -> anyhow::Result<()>
where
    F: for<'a> FnOnce(
        &'a TestApp,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = anyhow::Result<()>> + 'a>,
    >,
{
    with_test_app_with_config(|_| {}, f).await
}

pub async fn with_test_app_with_config<C, F>(configure: C, f: F) -> anyhow::Result<()>
where
    C: FnOnce(&mut Config),
    F: for<'a> FnOnce(
        &'a TestApp,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = anyhow::Result<()>> + 'a>,
    >,
{
    let app = TestApp::new_with_config(configure);

    let result = std::panic::AssertUnwindSafe(f(&app)).catch_unwind().await;

    match result {
        Ok(r) => r,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}
