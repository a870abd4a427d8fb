use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use qwenproxy_core::{AppState, ProxyError, RequestContext, client_ip};
use tracing::Instrument;

/// Assigns a request id, checks the per-IP rate limit, and stamps every
/// response with `X-Request-ID` and `X-RateLimit-*` regardless of outcome.
/// Runs before routing so a rejected request never reaches a handler.
pub async fn request_pipeline(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    mut request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let ctx = RequestContext::new();
    let ip = client_ip(request.headers(), remote.ip());
    let outcome = state.rate_limiter.check(ip).await;
    request.extensions_mut().insert(ctx.clone());

    let span = tracing::info_span!("request", request_id = %ctx.request_id, client_ip = %ip);
    let response = async move {
        if !outcome.allowed {
            tracing::warn!("rate limit exceeded");
            return ProxyError::rate_limited().into_response();
        }
        next.run(request).await
    }
    .instrument(span)
    .await;

    stamp_headers(response, &ctx, outcome.limit, outcome.remaining)
}

fn stamp_headers(
    mut response: Response,
    ctx: &RequestContext,
    limit: u32,
    remaining: u32,
) -> Response {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        headers.insert("x-request-id", value);
    }
    headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(1u32));
    if response.status() == axum::http::StatusCode::TOO_MANY_REQUESTS {
        headers.insert("retry-after", HeaderValue::from_static("1"));
    }
    response
}
