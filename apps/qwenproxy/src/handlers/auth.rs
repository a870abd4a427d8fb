use axum::Json;
use axum::extract::State;
use qwenproxy_auth::credentials::now_ms;
use qwenproxy_core::{AppState, ProxyError};
use qwenproxy_protocol::auth::{AuthLoginResponse, AuthLoginStatus, AuthStatusResponse};
use tracing::warn;

/// Non-mutating check: reports whether valid credentials are present
/// without triggering a refresh or the device flow.
pub async fn auth_status(State(state): State<AppState>) -> Json<AuthStatusResponse> {
    match state.auth.current().await {
        Some(creds) if !creds.is_expiring_within(now_ms(), 0) => Json(AuthStatusResponse {
            authenticated: true,
            expires_at: Some(creds.expiry_date),
        }),
        _ => Json(AuthStatusResponse {
            authenticated: false,
            expires_at: None,
        }),
    }
}

/// Triggers device-flow re-authorization unless already authenticated. The
/// challenge's verification URL and user code are returned immediately; the
/// poll-to-completion and credential persistence continue on a background
/// task so this handler never blocks for the device-flow deadline.
pub async fn auth_login(State(state): State<AppState>) -> Result<Json<AuthLoginResponse>, ProxyError> {
    if let Some(creds) = state.auth.current().await
        && !creds.is_expiring_within(now_ms(), 0)
    {
        return Ok(Json(AuthLoginResponse {
            status: AuthLoginStatus::AlreadyAuthenticated,
            verification_uri: None,
            user_code: None,
        }));
    }

    let challenge = state
        .auth
        .begin_login()
        .await
        .map_err(|err| ProxyError::bad_gateway(err.to_string()))?;

    let verification_uri = challenge
        .verification_uri_complete
        .clone()
        .unwrap_or_else(|| challenge.verification_uri.clone());
    let user_code = challenge.user_code.clone();

    let auth = state.auth.clone();
    tokio::spawn(async move {
        if let Err(err) = auth.finish_login(challenge).await {
            warn!(error = %err, "background device-flow login did not complete");
        }
    });

    Ok(Json(AuthLoginResponse {
        status: AuthLoginStatus::Started,
        verification_uri: Some(verification_uri),
        user_code: Some(user_code),
    }))
}
