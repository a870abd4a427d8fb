use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Digest;
use tokio::time::Instant;

use crate::credentials::{Credentials, now_ms};

const DEVICE_FLOW_DEADLINE: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("refresh rejected by upstream ({status}): {body}")]
    RefreshRejected { status: u16, body: String },
    #[error("device authorization rejected ({status}): {body}")]
    DeviceAuthRejected { status: u16, body: String },
    #[error("device code denied by user")]
    Denied,
    #[error("device code expired before authorization completed")]
    Expired,
    #[error("transport error contacting oauth endpoint: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed oauth response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct PkceChallenge {
    pub verifier: String,
    pub challenge: String,
}

impl PkceChallenge {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        let verifier = URL_SAFE_NO_PAD.encode(bytes);
        let challenge = URL_SAFE_NO_PAD.encode(sha2::Sha256::digest(verifier.as_bytes()));
        Self { verifier, challenge }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceChallenge {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: Option<String>,
    pub interval: Duration,
    pub expires_in: Duration,
    pub verifier: String,
}

#[derive(Debug, Deserialize)]
struct DeviceAuthResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    #[serde(default)]
    verification_uri_complete: Option<String>,
    #[serde(default = "default_interval")]
    interval: u64,
    expires_in: u64,
}

fn default_interval() -> u64 {
    5
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default = "default_token_type")]
    token_type: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    resource_url: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

pub enum PollOutcome {
    Ready(Credentials),
    Pending,
    Denied,
    Expired,
}

/// Talks to the vendor's OAuth2 device-authorization + token endpoints.
#[derive(Clone)]
pub struct OAuthClient {
    http: reqwest::Client,
    base_url: String,
    device_auth_url: String,
    client_id: String,
    scope: String,
}

impl OAuthClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        device_auth_url: impl Into<String>,
        client_id: impl Into<String>,
        scope: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            device_auth_url: device_auth_url.into(),
            client_id: client_id.into(),
            scope: scope.into(),
        }
    }

    fn token_endpoint(&self) -> String {
        format!("{}/api/v1/oauth2/token", self.base_url.trim_end_matches('/'))
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<Credentials, OAuthError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
        ];
        let resp = self
            .http
            .post(self.token_endpoint())
            .form(&form)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(OAuthError::RefreshRejected {
                status: status.as_u16(),
                body,
            });
        }
        let decoded: TokenResponse = serde_json::from_str(&body)?;
        if let Some(error) = decoded.error {
            return Err(OAuthError::RefreshRejected {
                status: status.as_u16(),
                body: decoded.error_description.unwrap_or(error),
            });
        }
        let Some(access_token) = decoded.access_token else {
            return Err(OAuthError::RefreshRejected {
                status: status.as_u16(),
                body: "missing access_token in refresh response".to_string(),
            });
        };
        let expires_in = decoded.expires_in.unwrap_or(3600);
        Ok(Credentials {
            access_token,
            token_type: decoded.token_type,
            refresh_token: decoded.refresh_token.unwrap_or_else(|| refresh_token.to_string()),
            expiry_date: now_ms() + expires_in * 1000,
            resource_url: decoded.resource_url,
        })
    }

    pub async fn start_device_auth(&self) -> Result<DeviceChallenge, OAuthError> {
        let pkce = PkceChallenge::generate();
        let form = [
            ("client_id", self.client_id.as_str()),
            ("scope", self.scope.as_str()),
            ("code_challenge", pkce.challenge.as_str()),
            ("code_challenge_method", "S256"),
        ];
        let resp = self
            .http
            .post(&self.device_auth_url)
            .form(&form)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(OAuthError::DeviceAuthRejected {
                status: status.as_u16(),
                body,
            });
        }
        let decoded: DeviceAuthResponse = serde_json::from_str(&body)?;
        Ok(DeviceChallenge {
            device_code: decoded.device_code,
            user_code: decoded.user_code,
            verification_uri: decoded.verification_uri,
            verification_uri_complete: decoded.verification_uri_complete,
            interval: Duration::from_secs(decoded.interval.max(1)),
            expires_in: Duration::from_secs(decoded.expires_in),
            verifier: pkce.verifier,
        })
    }

    async fn poll_once(&self, challenge: &DeviceChallenge) -> Result<PollOutcome, OAuthError> {
        let form = [
            ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
            ("device_code", challenge.device_code.as_str()),
            ("client_id", self.client_id.as_str()),
            ("code_verifier", challenge.verifier.as_str()),
        ];
        let resp = self
            .http
            .post(self.token_endpoint())
            .form(&form)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            let decoded: Result<TokenResponse, _> = serde_json::from_str(&body);
            if let Ok(decoded) = decoded
                && let Some(error) = decoded.error.as_deref()
            {
                return Ok(match error {
                    "authorization_pending" | "slow_down" => PollOutcome::Pending,
                    "access_denied" => PollOutcome::Denied,
                    "expired_token" => PollOutcome::Expired,
                    _ => {
                        return Err(OAuthError::RefreshRejected {
                            status: status.as_u16(),
                            body: decoded.error_description.unwrap_or_else(|| error.to_string()),
                        });
                    }
                });
            }
            return Err(OAuthError::RefreshRejected {
                status: status.as_u16(),
                body,
            });
        }
        let decoded: TokenResponse = serde_json::from_str(&body)?;
        let Some(access_token) = decoded.access_token else {
            return Ok(PollOutcome::Pending);
        };
        let expires_in = decoded.expires_in.unwrap_or(3600);
        Ok(PollOutcome::Ready(Credentials {
            access_token,
            token_type: decoded.token_type,
            refresh_token: decoded.refresh_token.unwrap_or_default(),
            expiry_date: now_ms() + expires_in * 1000,
            resource_url: decoded.resource_url,
        }))
    }

    /// Polls at the server-advertised interval until success, denial,
    /// expiry, or the ten-minute overall deadline.
    pub async fn poll_device_token(
        &self,
        challenge: &DeviceChallenge,
    ) -> Result<Credentials, OAuthError> {
        let deadline = Instant::now() + DEVICE_FLOW_DEADLINE.min(challenge.expires_in);
        loop {
            match self.poll_once(challenge).await? {
                PollOutcome::Ready(creds) => return Ok(creds),
                PollOutcome::Denied => return Err(OAuthError::Denied),
                PollOutcome::Expired => return Err(OAuthError::Expired),
                PollOutcome::Pending => {}
            }
            if Instant::now() >= deadline {
                return Err(OAuthError::Expired);
            }
            tokio::time::sleep(challenge.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_challenge_is_sha256_of_verifier() {
        let pkce = PkceChallenge::generate();
        let expected = URL_SAFE_NO_PAD.encode(sha2::Sha256::digest(pkce.verifier.as_bytes()));
        assert_eq!(pkce.challenge, expected);
        assert!(!pkce.verifier.contains('='));
    }
}
