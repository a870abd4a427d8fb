use std::time::Duration;

use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use qwenproxy_core::AppState;
use tower_http::cors::CorsLayer;

use crate::handlers::{auth, chat, models};
use crate::middleware::request_pipeline;

pub fn build(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::AllowOrigin::exact(HeaderValue::from_static("*")))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
        .max_age(Duration::from_secs(86_400));

    Router::new()
        .route("/v1/chat/completions", post(chat::create_chat_completion))
        .route("/v1/models", get(models::list_models))
        .route("/v1/auth/login", post(auth::auth_login))
        .route("/v1/auth/status", get(auth::auth_status))
        .fallback(preflight_fallback)
        .layer(middleware::from_fn_with_state(state.clone(), request_pipeline))
        .layer(cors)
        .with_state(state)
}

/// Any route not matched above. Only `OPTIONS` is meaningful here; the CORS
/// layer has already attached the preflight headers by the time this runs.
async fn preflight_fallback(method: Method) -> StatusCode {
    if method == Method::OPTIONS {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
