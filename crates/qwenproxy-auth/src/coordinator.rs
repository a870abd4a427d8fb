use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::credentials::{Credentials, now_ms};
use crate::oauth::{OAuthClient, OAuthError};
use crate::store::{CredentialStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no credentials on disk and device authorization failed: {0}")]
    NoCredentials(#[source] OAuthError),
    #[error("refresh token is empty; device re-authorization required: {0}")]
    NoRefreshToken(#[source] OAuthError),
    #[error("device authorization flow failed: {0}")]
    DeviceFlow(#[from] OAuthError),
    #[error("failed to persist credentials: {0}")]
    Store(#[from] StoreError),
}

/// Owns the single authoritative in-memory copy of the vendor credentials
/// and mediates every read and write against the on-disk store.
///
/// Two distinct locks guard state: `credentials` (a shared read/write lock)
/// and `refresh_lock` (an exclusive single-flight gate). They are always
/// acquired in the order refresh-lock -> credentials-lock.
pub struct AuthCoordinator {
    store: CredentialStore,
    oauth: OAuthClient,
    refresh_buffer: Duration,
    credentials: RwLock<Option<Credentials>>,
    refresh_lock: Mutex<()>,
}

impl AuthCoordinator {
    pub fn new(store: CredentialStore, oauth: OAuthClient, refresh_buffer: Duration) -> Self {
        Self {
            store,
            oauth,
            refresh_buffer,
            credentials: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Returns valid, non-expiring-soon credentials, refreshing or running
    /// the device-authorization flow as needed. At most one refresh is ever
    /// in flight; concurrent callers that arrive while a refresh is running
    /// observe its result instead of starting their own.
    pub async fn ensure_authenticated(&self) -> Result<Credentials, AuthError> {
        if let Some(creds) = self.read_fresh_enough().await {
            return Ok(creds);
        }

        let _guard = self.refresh_lock.lock().await;

        // Another caller may have refreshed while we waited for the lock.
        if let Some(creds) = self.read_fresh_enough().await {
            return Ok(creds);
        }

        let current = self.credentials.read().await.clone();
        let refresh_attempt = match &current {
            Some(creds) if creds.has_refresh_token() => {
                match self.oauth.refresh(&creds.refresh_token).await {
                    Ok(mut refreshed) => {
                        if refreshed.resource_url.is_none() {
                            refreshed.resource_url = creds.resource_url.clone();
                        }
                        Some(Ok(refreshed))
                    }
                    Err(err) => {
                        warn!(error = %err, "token refresh failed, falling back to device flow");
                        Some(Err(err))
                    }
                }
            }
            Some(_) => {
                warn!("stored credentials have no refresh token, device flow required");
                None
            }
            None => None,
        };

        if let Some(Ok(refreshed)) = refresh_attempt {
            self.persist(refreshed.clone()).await?;
            return Ok(refreshed);
        }

        match self.run_device_flow().await {
            Ok(creds) => Ok(creds),
            Err(device_err) => match refresh_attempt {
                Some(Err(_)) => Err(AuthError::DeviceFlow(device_err)),
                None if current.is_some() => Err(AuthError::NoRefreshToken(device_err)),
                _ => Err(AuthError::NoCredentials(device_err)),
            },
        }
    }

    /// Forces a fresh device-authorization flow regardless of current state,
    /// blocking until it completes or fails.
    pub async fn authenticate_manually(&self) -> Result<Credentials, AuthError> {
        let _guard = self.refresh_lock.lock().await;
        Ok(self.run_device_flow().await?)
    }

    /// Starts a device-authorization challenge without waiting for the user
    /// to complete it. Pair with `finish_login` (typically spawned onto the
    /// background) so an HTTP handler can return the verification URL and
    /// user code immediately instead of blocking on the full poll loop.
    pub async fn begin_login(&self) -> Result<crate::oauth::DeviceChallenge, OAuthError> {
        self.oauth.start_device_auth().await
    }

    /// Polls a challenge started by `begin_login` to completion and persists
    /// the resulting credentials.
    pub async fn finish_login(&self, challenge: crate::oauth::DeviceChallenge) -> Result<Credentials, AuthError> {
        let _guard = self.refresh_lock.lock().await;
        let creds = self.oauth.poll_device_token(&challenge).await?;
        self.persist(creds.clone()).await?;
        Ok(creds)
    }

    pub async fn current(&self) -> Option<Credentials> {
        self.credentials.read().await.clone()
    }

    async fn read_fresh_enough(&self) -> Option<Credentials> {
        let loaded = self.load_into_memory().await?;
        if !loaded.is_expiring_within(now_ms(), self.refresh_buffer.as_millis() as i64) {
            Some(loaded)
        } else {
            None
        }
    }

    /// Loads from disk into the in-memory copy if we have not already. On a
    /// missing or unreadable file, clears the in-memory copy and returns None.
    async fn load_into_memory(&self) -> Option<Credentials> {
        if let Some(creds) = self.credentials.read().await.clone() {
            return Some(creds);
        }
        match self.store.load().await {
            Ok(creds) => {
                *self.credentials.write().await = Some(creds.clone());
                Some(creds)
            }
            Err(err) => {
                info!(error = %err, "no usable credentials on disk");
                None
            }
        }
    }

    async fn persist(&self, creds: Credentials) -> Result<(), StoreError> {
        self.store.save(&creds).await?;
        *self.credentials.write().await = Some(creds);
        Ok(())
    }

    async fn run_device_flow(&self) -> Result<Credentials, OAuthError> {
        let challenge = self.oauth.start_device_auth().await?;
        let url = challenge
            .verification_uri_complete
            .clone()
            .unwrap_or_else(|| challenge.verification_uri.clone());
        info!(
            verification_uri = %challenge.verification_uri,
            user_code = %challenge.user_code,
            "visit the verification URL and enter the user code to authorize this proxy"
        );
        try_open_url(&url);

        let creds = self.oauth.poll_device_token(&challenge).await?;
        if let Err(err) = self.persist(creds.clone()).await {
            warn!(error = %err, "device flow succeeded but failed to persist credentials");
        }
        Ok(creds)
    }
}

/// Best-effort platform "open URL" helper. Failure is non-fatal: the URL and
/// code were already logged for the operator to use by hand.
fn try_open_url(url: &str) {
    let result = if cfg!(target_os = "macos") {
        Command::new("open").arg(url).status()
    } else if cfg!(target_os = "windows") {
        Command::new("rundll32")
            .args(["url.dll,FileProtocolHandler", url])
            .status()
    } else {
        Command::new("xdg-open").arg(url).status()
    };
    if let Err(err) = result {
        info!(error = %err, "could not auto-open verification URL, open it manually");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn expired_creds(refresh_token: &str) -> Credentials {
        Credentials {
            access_token: "stale-token".into(),
            token_type: "Bearer".into(),
            refresh_token: refresh_token.into(),
            expiry_date: now_ms() - 60_000,
            resource_url: Some("https://dashscope.example.com/v1".into()),
        }
    }

    async fn coordinator_with_expired_creds(server: &MockServer, refresh_token: &str) -> AuthCoordinator {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path(), ".qwen");
        store.save(&expired_creds(refresh_token)).await.unwrap();
        let http = reqwest::Client::new();
        let oauth = OAuthClient::new(
            http,
            server.uri(),
            format!("{}/device/code", server.uri()),
            "client-id".to_string(),
            "scope".to_string(),
        );
        AuthCoordinator::new(store, oauth, Duration::from_secs(300))
    }

    #[tokio::test]
    async fn refresh_under_contention_calls_upstream_exactly_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/oauth2/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh-token",
                "token_type": "Bearer",
                "refresh_token": "new-refresh",
                "expires_in": 3600,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let coordinator = Arc::new(coordinator_with_expired_creds(&server, "old-refresh").await);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let coordinator = Arc::clone(&coordinator);
            handles.push(tokio::spawn(async move { coordinator.ensure_authenticated().await }));
        }
        for handle in handles {
            let creds = handle.await.unwrap().unwrap();
            assert_eq!(creds.access_token, "fresh-token");
        }
    }

    #[tokio::test]
    async fn ensure_authenticated_twice_in_a_row_makes_no_second_call_once_fresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh-token",
                "token_type": "Bearer",
                "refresh_token": "new-refresh",
                "expires_in": 3600,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let coordinator = coordinator_with_expired_creds(&server, "old-refresh").await;
        let first = coordinator.ensure_authenticated().await.unwrap();
        let second = coordinator.ensure_authenticated().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn missing_refresh_token_skips_straight_to_device_flow() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/device/code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "device_code": "devcode",
                "user_code": "ABCD-EFGH",
                "verification_uri": "https://example.com/activate",
                "interval": 1,
                "expires_in": 600,
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/oauth2/token"))
            .and(body_string_contains("device_code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "device-flow-token",
                "token_type": "Bearer",
                "refresh_token": "device-refresh",
                "expires_in": 3600,
            })))
            .mount(&server)
            .await;

        let coordinator = coordinator_with_expired_creds(&server, "").await;
        let creds = coordinator.ensure_authenticated().await.unwrap();
        assert_eq!(creds.access_token, "device-flow-token");
    }

    #[tokio::test]
    async fn refresh_rejection_falls_back_to_device_flow() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/oauth2/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/device/code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "device_code": "devcode",
                "user_code": "ABCD-EFGH",
                "verification_uri": "https://example.com/activate",
                "interval": 1,
                "expires_in": 600,
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/oauth2/token"))
            .and(body_string_contains("device_code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "recovered-token",
                "token_type": "Bearer",
                "refresh_token": "recovered-refresh",
                "expires_in": 3600,
            })))
            .mount(&server)
            .await;

        let coordinator = coordinator_with_expired_creds(&server, "old-refresh").await;
        let creds = coordinator.ensure_authenticated().await.unwrap();
        assert_eq!(creds.access_token, "recovered-token");
    }
}
