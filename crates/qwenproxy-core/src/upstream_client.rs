use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use qwenproxy_auth::Credentials;
use qwenproxy_protocol::chat::STRIPPED_EXTENSION_FIELDS;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("resolved base URL has no host: {0}")]
    NoHost(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },
}

/// Thin reqwest wrapper over the vendor chat-completions endpoint. Holds one
/// pooled client for the process lifetime; connection reuse is the point of
/// keeping it long-lived rather than building one per request.
pub struct UpstreamClient {
    http: reqwest::Client,
}

impl UpstreamClient {
    pub fn new() -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self { http })
    }

    /// Resolves the base URL to call: the credentials' own `resource_url`
    /// when present, else the configured default. Adds a scheme and `/v1`
    /// suffix as needed, then rejects anything without a host.
    pub fn resolve_base_url(credentials: &Credentials, default: &str) -> Result<String, UpstreamError> {
        let raw = credentials
            .resource_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .unwrap_or(default);

        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("https://{raw}")
        };

        let base = if with_scheme.ends_with("/v1") {
            with_scheme
        } else {
            format!("{}/v1", with_scheme.trim_end_matches('/'))
        };

        let parsed = reqwest::Url::parse(&base).map_err(|_| UpstreamError::NoHost(base.clone()))?;
        if parsed.host_str().is_none_or(str::is_empty) {
            return Err(UpstreamError::NoHost(base));
        }
        Ok(base)
    }

    /// Strips vendor-specific extension fields from the request body so the
    /// forwarded payload stays OpenAI wire-compatible for downstream tools.
    pub fn strip_extension_fields(body: &mut Value) {
        if let Value::Object(map) = body {
            for field in STRIPPED_EXTENSION_FIELDS {
                map.remove(*field);
            }
        }
    }

    /// Issues the bearer-authed POST and returns the raw byte stream of the
    /// response body for the caller to feed through the chunk parser.
    pub async fn chat_completions(
        &self,
        base_url: &str,
        credentials: &Credentials,
        mut body: Value,
    ) -> Result<impl Stream<Item = reqwest::Result<Bytes>> + use<>, UpstreamError> {
        Self::strip_extension_fields(&mut body);
        let url = format!("{base_url}/chat/completions");
        let response = self
            .http
            .post(url)
            .bearer_auth(&credentials.access_token)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.bytes_stream())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(resource_url: Option<&str>) -> Credentials {
        Credentials {
            access_token: "tok".into(),
            token_type: "Bearer".into(),
            refresh_token: "ref".into(),
            expiry_date: 0,
            resource_url: resource_url.map(str::to_string),
        }
    }

    #[test]
    fn uses_default_when_resource_url_absent() {
        let base = UpstreamClient::resolve_base_url(&creds(None), "https://dashscope.aliyuncs.com/compatible-mode").unwrap();
        assert_eq!(base, "https://dashscope.aliyuncs.com/compatible-mode/v1");
    }

    #[test]
    fn prefers_credentials_resource_url() {
        let base = UpstreamClient::resolve_base_url(&creds(Some("vendor.example.com")), "https://default.example.com").unwrap();
        assert_eq!(base, "https://vendor.example.com/v1");
    }

    #[test]
    fn does_not_duplicate_v1_suffix() {
        let base = UpstreamClient::resolve_base_url(&creds(Some("https://vendor.example.com/v1")), "https://default.example.com").unwrap();
        assert_eq!(base, "https://vendor.example.com/v1");
    }

    #[test]
    fn empty_resource_url_falls_back_to_default() {
        let base = UpstreamClient::resolve_base_url(&creds(Some("")), "https://default.example.com").unwrap();
        assert_eq!(base, "https://default.example.com/v1");
    }

    #[test]
    fn rejects_hostless_url() {
        let err = UpstreamClient::resolve_base_url(&creds(Some("https:///just-a-path")), "https://default.example.com");
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn non_2xx_is_surfaced_with_status_and_body() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("upstream overloaded"))
            .mount(&server)
            .await;

        let client = UpstreamClient::new().unwrap();
        let err = client
            .chat_completions(&format!("{}/v1", server.uri()), &creds(None), serde_json::json!({}))
            .await
            .unwrap_err();
        match err {
            UpstreamError::Rejected { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "upstream overloaded");
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn strips_extension_fields() {
        let mut body = serde_json::json!({
            "model": "qwen",
            "reasoning_effort": "high",
            "include_reasoning": true,
        });
        UpstreamClient::strip_extension_fields(&mut body);
        assert_eq!(body, serde_json::json!({ "model": "qwen" }));
    }
}
