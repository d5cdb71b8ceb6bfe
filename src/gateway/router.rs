//! HTTP router and handlers

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, RawQuery, State, rejection::BytesRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, warn};

use crate::cache::{ComputationCache, Ttl};
use crate::forward::ForwardExecutor;
use crate::key::derive_key;
use crate::request::ProxyRequest;
use crate::{Error, Result};

/// Shared application state
pub struct AppState {
    /// The computation cache all requests go through
    pub cache: ComputationCache,
    /// Origin client
    pub executor: ForwardExecutor,
    /// TTLs applied when the query string omits them or they do not parse
    pub default_ttl: Ttl,
    /// Backing store name, for health output
    pub store_name: &'static str,
}

/// Create the router
pub fn create_router(state: Arc<AppState>, max_body_size: usize) -> Router {
    Router::new()
        .route("/proxy", post(proxy_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// POST /proxy?min_ttl=..&max_ttl=..
async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        // Oversized or unreadable bodies get the same JSON envelope as any other error
        Err(rejection) => {
            return error_response(&Error::Encoding(format!(
                "request body rejected: {}",
                rejection.body_text()
            )));
        }
    };
    match proxy(&state, query.as_deref(), body).await {
        Ok(envelope) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            envelope,
        )
            .into_response(),
        Err(err) => error_response(&err),
    }
}

async fn proxy(state: &AppState, query: Option<&str>, body: Bytes) -> Result<Bytes> {
    let ttl = resolve_ttl(query, state.default_ttl)?;
    let request = ProxyRequest::decode(body)?;
    validate_target(&request)?;

    let key = derive_key(&request);
    debug!(
        key = %key,
        method = %request.method,
        url = %request.url,
        min_ttl = %humantime::format_duration(ttl.min()),
        max_ttl = %humantime::format_duration(ttl.max()),
        "Proxy request"
    );

    let executor = state.executor.clone();
    state
        .cache
        .get(&key, ttl, move |cancel| async move {
            executor.execute(&request, cancel).await
        })
        .await
}

/// Read `min_ttl` / `max_ttl` from the query string.
///
/// Missing or unparsable values fall back to the defaults; only an inverted
/// pair is an error.
fn resolve_ttl(query: Option<&str>, defaults: Ttl) -> Result<Ttl> {
    let mut min = defaults.min();
    let mut max = defaults.max();

    for (name, value) in url::form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
        let slot = match name.as_ref() {
            "min_ttl" => &mut min,
            "max_ttl" => &mut max,
            _ => continue,
        };
        match parse_ttl(&value) {
            Some(ttl) => *slot = ttl,
            None => debug!(param = %name, value = %value, "Unparsable TTL, using default"),
        }
    }

    Ttl::new(min, max)
}

fn parse_ttl(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    humantime::parse_duration(raw).ok()
}

/// Reject requests the proxy will not replay before they reach the cache
fn validate_target(request: &ProxyRequest) -> Result<()> {
    if !request.is_idempotent_read() {
        return Err(Error::Validation(format!(
            "method {} is not supported; only GET and HEAD are proxied",
            request.method
        )));
    }
    let url = url::Url::parse(&request.url)
        .map_err(|e| Error::Encoding(format!("invalid URL {}: {e}", request.url)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::Validation(format!(
            "unsupported URL scheme: {}",
            url.scheme()
        )));
    }
    Ok(())
}

fn error_response(err: &Error) -> Response {
    let status = err.status_code();
    if status.is_server_error() {
        warn!(status = status.as_u16(), error = %err, "Proxy request failed");
    } else {
        debug!(status = status.as_u16(), error = %err, "Proxy request rejected");
    }
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

/// Health check handler
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "store": state.store_name,
    }))
}

/// Cache statistics handler
async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.cache.stats())
}
