use serde::{Deserialize, Serialize};

/// OAuth2 credential record held for the vendor upstream.
///
/// `expiry_date` is milliseconds since the Unix epoch, matching the vendor's
/// `expires_in`-derived wire format so the on-disk JSON round-trips byte
/// identically when nothing has changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: String,
    pub expiry_date: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_url: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Credentials {
    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.is_empty()
    }

    /// Milliseconds remaining until `expiry_date`, negative if already expired.
    pub fn millis_until_expiry(&self, now_ms: i64) -> i64 {
        self.expiry_date - now_ms
    }

    pub fn is_expiring_within(&self, now_ms: i64, buffer_ms: i64) -> bool {
        self.millis_until_expiry(now_ms) < buffer_ms
    }
}

pub fn now_ms() -> i64 {
    let now = time::OffsetDateTime::now_utc();
    now.unix_timestamp() * 1000 + i64::from(now.millisecond())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_buffer_respects_configured_window() {
        let creds = Credentials {
            access_token: "a".into(),
            token_type: "Bearer".into(),
            refresh_token: "r".into(),
            expiry_date: 10_000,
            resource_url: None,
        };
        assert!(creds.is_expiring_within(9_000, 2_000));
        assert!(!creds.is_expiring_within(5_000, 2_000));
    }

    #[test]
    fn missing_refresh_token_detected() {
        let creds = Credentials {
            access_token: "a".into(),
            token_type: "Bearer".into(),
            refresh_token: String::new(),
            expiry_date: 10_000,
            resource_url: None,
        };
        assert!(!creds.has_refresh_token());
    }

    #[test]
    fn round_trip_preserves_fields() {
        let creds = Credentials {
            access_token: "tok".into(),
            token_type: "Bearer".into(),
            refresh_token: "ref".into(),
            expiry_date: 123,
            resource_url: Some("https://example.com/v1".into()),
        };
        let json = serde_json::to_string(&creds).unwrap();
        let back: Credentials = serde_json::from_str(&json).unwrap();
        assert_eq!(creds, back);
    }
}
