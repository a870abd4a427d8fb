pub mod circuit_breaker;
pub mod config;
pub mod correlator;
pub mod error;
pub mod rate_limiter;
pub mod state;
pub mod upstream_client;

pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use config::{AppConfig, ConfigError};
pub use correlator::{RequestContext, generate_request_id};
pub use error::ProxyError;
pub use rate_limiter::{RateLimitOutcome, RateLimiter, client_ip};
pub use state::AppState;
pub use upstream_client::{UpstreamClient, UpstreamError};
