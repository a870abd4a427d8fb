use std::sync::Arc;

use qwenproxy_auth::{AuthCoordinator, CredentialStore, OAuthClient};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::AppConfig;
use crate::rate_limiter::RateLimiter;
use crate::upstream_client::UpstreamClient;

/// Shared handles threaded through every request via axum's `State`
/// extractor. Everything here is either already internally synchronized or
/// immutable after construction, so the whole bundle is `Clone` as a cheap
/// `Arc` fan-out.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub auth: Arc<AuthCoordinator>,
    pub upstream: Arc<UpstreamClient>,
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn build(config: AppConfig) -> anyhow::Result<Self> {
        let store = CredentialStore::new(std::env::current_dir()?, &config.qwen_dir);
        let oauth_http = reqwest::Client::builder().timeout(config.read_timeout()).build()?;
        let oauth = OAuthClient::new(
            oauth_http,
            config.qwen_oauth_base_url.clone(),
            config.qwen_oauth_device_auth_url.clone(),
            config.qwen_oauth_client_id.clone(),
            config.qwen_oauth_scope.clone(),
        );
        let auth = AuthCoordinator::new(store, oauth, config.token_refresh_buffer());
        let upstream = UpstreamClient::new()?;
        let circuit_breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
        let rate_limiter = RateLimiter::new(config.rate_limit_rps, config.rate_limit_burst);

        Ok(Self {
            config: Arc::new(config),
            auth: Arc::new(auth),
            upstream: Arc::new(upstream),
            circuit_breaker: Arc::new(circuit_breaker),
            rate_limiter: Arc::new(rate_limiter),
        })
    }

    /// Spawns the rate limiter's idle-tracker reaper on the current runtime.
    /// Intended to be called once from `main` after the state is built.
    pub fn spawn_background_tasks(&self) {
        let rate_limiter = self.rate_limiter.clone();
        tokio::spawn(async move {
            rate_limiter.run_reaper().await;
        });
    }
}
