use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use qwenproxy_protocol::error::ApiErrorBody;

/// The single error shape crossing the HTTP boundary. Component-level
/// errors are `thiserror` enums matched on kind; this is where they get
/// flattened into a status code and an OpenAI-shaped JSON body.
#[derive(Debug)]
pub struct ProxyError {
    pub status: StatusCode,
    pub body: ApiErrorBody,
}

impl ProxyError {
    pub fn new(status: StatusCode, kind: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ApiErrorBody::new(kind, message),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request_error", message)
    }

    pub fn rate_limited() -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: ApiErrorBody::rate_limit_exceeded(),
        }
    }

    pub fn circuit_open() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "circuit_open_error",
            "Upstream is temporarily unavailable; circuit breaker is open",
        )
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "authentication_error", message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "upstream_error", message)
    }

    pub fn internal(request_id: &str) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            format!("internal error, reference request id {request_id}"),
        )
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = serde_json::to_vec(&self.body).unwrap_or_default();
        Response::builder()
            .status(status)
            .header(axum::http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}
