use std::time::Duration;

use clap::Parser;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be between 1 and 65535, got {value}")]
    InvalidPort { field: &'static str, value: u32 },
    #[error("{field} is not a valid URL: {value}")]
    InvalidUrl { field: &'static str, value: String },
    #[error("{field} is not a valid duration: {value}")]
    InvalidDuration { field: &'static str, value: String },
}

/// Process-wide configuration, loaded once from the environment (and an
/// optional `.env` file via `clap`'s derive+env support) and validated
/// eagerly before the listener binds. Shared read-only as `Arc<AppConfig>`.
#[derive(Debug, Clone, Parser)]
#[command(name = "qwenproxy", about = "OpenAI-compatible proxy for a Qwen-style OAuth2 upstream")]
pub struct AppConfig {
    #[arg(long, env = "SERVER_PORT", default_value_t = 8080)]
    pub server_port: u16,

    #[arg(long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    pub server_host: String,

    #[arg(long, env = "READ_TIMEOUT", default_value = "30s")]
    pub read_timeout: String,

    #[arg(long, env = "WRITE_TIMEOUT", default_value = "30s")]
    pub write_timeout: String,

    #[arg(long, env = "QWEN_OAUTH_BASE_URL", default_value = "https://chat.qwen.ai")]
    pub qwen_oauth_base_url: String,

    #[arg(long, env = "QWEN_OAUTH_CLIENT_ID", default_value = "f0304373b74a44d2b584a3fb70ca9e56")]
    pub qwen_oauth_client_id: String,

    #[arg(long, env = "QWEN_OAUTH_SCOPE", default_value = "openid profile email model.completion")]
    pub qwen_oauth_scope: String,

    #[arg(
        long,
        env = "QWEN_OAUTH_DEVICE_AUTH_URL",
        default_value = "https://chat.qwen.ai/api/v1/oauth2/device/code"
    )]
    pub qwen_oauth_device_auth_url: String,

    #[arg(long, env = "QWEN_DIR", default_value = ".qwen")]
    pub qwen_dir: String,

    #[arg(long, env = "TOKEN_REFRESH_BUFFER", default_value = "5m")]
    pub token_refresh_buffer: String,

    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value = "30s")]
    pub shutdown_timeout: String,

    #[arg(long, env = "DEBUG_MODE", default_value_t = false)]
    pub debug_mode: bool,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    #[arg(long, env = "RATE_LIMIT_RPS", default_value_t = 10)]
    pub rate_limit_rps: u32,

    #[arg(long, env = "RATE_LIMIT_BURST", default_value_t = 20)]
    pub rate_limit_burst: u32,

    #[arg(long, env = "API_BASE_URL", default_value = "https://dashscope.aliyuncs.com/compatible-mode")]
    pub api_base_url: String,

    #[arg(long, env = "TRUSTED_PROXIES", value_delimiter = ',', default_value = "")]
    pub trusted_proxies: Vec<String>,

    #[arg(long, env = "ENABLE_TLS", default_value_t = false)]
    pub enable_tls: bool,

    #[arg(long, env = "TLS_CERT_FILE")]
    pub tls_cert_file: Option<String>,

    #[arg(long, env = "TLS_KEY_FILE")]
    pub tls_key_file: Option<String>,
}

impl AppConfig {
    /// Parses from `std::env` (clap's `env` attributes) and validates every
    /// field eagerly. A validation failure aborts startup with the offending
    /// field named in the error.
    pub fn load() -> Result<Self, ConfigError> {
        let config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_port == 0 {
            return Err(ConfigError::InvalidPort {
                field: "SERVER_PORT",
                value: 0,
            });
        }
        validate_url("QWEN_OAUTH_BASE_URL", &self.qwen_oauth_base_url)?;
        validate_url("QWEN_OAUTH_DEVICE_AUTH_URL", &self.qwen_oauth_device_auth_url)?;
        validate_url("API_BASE_URL", &self.api_base_url)?;
        parse_duration("READ_TIMEOUT", &self.read_timeout)?;
        parse_duration("WRITE_TIMEOUT", &self.write_timeout)?;
        parse_duration("TOKEN_REFRESH_BUFFER", &self.token_refresh_buffer)?;
        parse_duration("SHUTDOWN_TIMEOUT", &self.shutdown_timeout)?;
        if self.enable_tls && (self.tls_cert_file.is_none() || self.tls_key_file.is_none()) {
            return Err(ConfigError::InvalidUrl {
                field: "TLS_CERT_FILE/TLS_KEY_FILE",
                value: "ENABLE_TLS=true requires both to be set".to_string(),
            });
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        parse_duration("READ_TIMEOUT", &self.read_timeout).expect("validated at startup")
    }

    pub fn write_timeout(&self) -> Duration {
        parse_duration("WRITE_TIMEOUT", &self.write_timeout).expect("validated at startup")
    }

    pub fn token_refresh_buffer(&self) -> Duration {
        parse_duration("TOKEN_REFRESH_BUFFER", &self.token_refresh_buffer).expect("validated at startup")
    }

    pub fn shutdown_timeout(&self) -> Duration {
        parse_duration("SHUTDOWN_TIMEOUT", &self.shutdown_timeout).expect("validated at startup")
    }
}

fn validate_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    reqwest::Url::parse(value)
        .map(|_| ())
        .map_err(|_| ConfigError::InvalidUrl {
            field,
            value: value.to_string(),
        })
}

/// Parses simple Go-style duration strings (`30s`, `5m`, `1h`); this proxy
/// never needs more than a single unit suffix.
fn parse_duration(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let value = value.trim();
    let invalid = || ConfigError::InvalidDuration {
        field,
        value: value.to_string(),
    };
    let (number, unit) = value.split_at(value.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?);
    let amount: u64 = number.parse().map_err(|_| invalid())?;
    let seconds = match unit {
        "s" => amount,
        "m" => amount * 60,
        "h" => amount * 3600,
        _ => return Err(invalid()),
    };
    Ok(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minute_and_second_durations() {
        assert_eq!(parse_duration("x", "5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("x", "30s").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!(parse_duration("x", "5d").is_err());
    }

    #[test]
    fn validate_rejects_bad_url() {
        let mut config = AppConfig::parse_from(["qwenproxy"]);
        config.qwen_oauth_base_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_config_validates() {
        let config = AppConfig::parse_from(["qwenproxy"]);
        assert!(config.validate().is_ok());
    }
}
