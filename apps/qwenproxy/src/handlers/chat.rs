use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use bytes::Bytes;
use futures_util::StreamExt;
use qwenproxy_core::{AppState, ProxyError, RequestContext};
use qwenproxy_stream::{StreamEngine, reshape_completion_response};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

pub async fn create_chat_completion(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(mut body): Json<Value>,
) -> Result<Response, ProxyError> {
    if !state.circuit_breaker.try_admit() {
        return Err(ProxyError::circuit_open());
    }

    let streaming = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

    let credentials = state
        .auth
        .ensure_authenticated()
        .await
        .map_err(|err| ProxyError::unauthorized(err.to_string()))?;

    let base_url = qwenproxy_core::UpstreamClient::resolve_base_url(&credentials, &state.config.api_base_url)
        .map_err(|err| ProxyError::bad_gateway(err.to_string()))?;

    if !streaming {
        // stream=false is served as one shot, not through the SSE engine.
        if let Value::Object(map) = &mut body {
            map.insert("stream".to_string(), Value::Bool(false));
        }
        return chat_completion_oneshot(&state, &base_url, &credentials, body).await;
    }

    chat_completion_streaming(&state, &ctx, &base_url, &credentials, body).await
}

async fn chat_completion_oneshot(
    state: &AppState,
    base_url: &str,
    credentials: &qwenproxy_auth::Credentials,
    body: Value,
) -> Result<Response, ProxyError> {
    let mut bytes_stream = Box::pin(
        state
            .upstream
            .chat_completions(base_url, credentials, body)
            .await
            .map_err(|err| {
                state.circuit_breaker.record_failure();
                ProxyError::bad_gateway(err.to_string())
            })?,
    );

    let mut buffer = Vec::new();
    while let Some(chunk) = bytes_stream.next().await {
        match chunk {
            Ok(bytes) => buffer.extend_from_slice(&bytes),
            Err(err) => {
                state.circuit_breaker.record_failure();
                return Err(ProxyError::bad_gateway(err.to_string()));
            }
        }
    }

    let upstream_json: Value = serde_json::from_slice(&buffer).map_err(|err| {
        state.circuit_breaker.record_failure();
        ProxyError::bad_gateway(format!("upstream returned invalid JSON: {err}"))
    })?;
    state.circuit_breaker.record_success();

    let reshaped = reshape_completion_response(&upstream_json);
    Ok((StatusCode::OK, Json(reshaped)).into_response())
}

async fn chat_completion_streaming(
    state: &AppState,
    ctx: &RequestContext,
    base_url: &str,
    credentials: &qwenproxy_auth::Credentials,
    body: Value,
) -> Result<Response, ProxyError> {
    let byte_stream = state
        .upstream
        .chat_completions(base_url, credentials, body)
        .await
        .map_err(|err| {
            state.circuit_breaker.record_failure();
            ProxyError::bad_gateway(err.to_string())
        })?;

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::convert::Infallible>>(32);
    let circuit_breaker = state.circuit_breaker.clone();
    let request_id = ctx.request_id.clone();

    tokio::spawn(async move {
        let mut engine = StreamEngine::default();
        let mut byte_stream = Box::pin(byte_stream);
        let mut pending = String::new();
        let mut saw_error = false;

        'outer: while let Some(chunk) = byte_stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    warn!(request_id = %request_id, error = %err, "upstream stream read failed");
                    saw_error = true;
                    break;
                }
            };
            pending.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = pending.find('\n') {
                let line = pending[..pos].to_string();
                pending.drain(..=pos);
                for frame in engine.feed_line(&line) {
                    if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                        break 'outer;
                    }
                }
                if engine.is_terminating() {
                    break 'outer;
                }
            }
        }

        if saw_error {
            circuit_breaker.record_failure();
        } else {
            circuit_breaker.record_success();
        }
        info!(request_id = %request_id, chunk_count = engine.state().chunk_count, "stream finished");
    });

    let body = Body::from_stream(ReceiverStream::new(rx));
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("x-request-id", ctx.request_id.clone())
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}
