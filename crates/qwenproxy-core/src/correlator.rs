use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

/// Carries the request identifier and a cancellation signal through the
/// request pipeline. The identifier is echoed as `X-Request-ID` and attached
/// to every structured log call in the request's scope.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: generate_request_id(),
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// 16 bytes of cryptographic randomness, hex-encoded lowercase. Falls back
/// to a monotonic-timestamp identifier if the random source fails.
pub fn generate_request_id() -> String {
    let mut bytes = [0u8; 16];
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        rand::rng().fill_bytes(&mut bytes)
    }));
    match result {
        Ok(()) => hex_encode(&bytes),
        Err(_) => fallback_request_id(),
    }
}

fn fallback_request_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("req_{nanos:x}")
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_is_32_lowercase_hex_chars() {
        let id = generate_request_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn request_ids_are_unique() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert_ne!(a, b);
    }
}
