//! Header forwarding for request dispatch (§6). An allowlist, not a
//! blocklist: only the headers the upstream actually needs cross the
//! proxy boundary, so client-side cookies or custom headers never leak
//! to a third-party upstream.

use http::HeaderMap;
use reqwest::RequestBuilder;

const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

/// Headers copied onto the upstream request when present on the inbound one.
const ALLOWED: &[&str] = &["x-api-key", "authorization", "anthropic-beta", "user-agent", "content-type"];

/// Copies the allowlisted headers from `headers` onto `builder`, defaulting
/// `anthropic-version` to `2023-06-01` when the client omits it.
pub fn forward_headers(mut builder: RequestBuilder, headers: &HeaderMap) -> RequestBuilder {
    for name in ALLOWED {
        if let Some(value) = headers.get(*name) {
            builder = builder.header(*name, value);
        }
    }

    let version = headers.get("anthropic-version").cloned();
    builder = builder.header("anthropic-version", version.unwrap_or_else(|| {
        http::HeaderValue::from_static(DEFAULT_ANTHROPIC_VERSION)
    }));

    builder
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn content_type_passes_through() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.insert("cookie", HeaderValue::from_static("session=abc"));
        let client = reqwest::Client::new();
        let req = forward_headers(client.post("http://example.invalid"), &headers).build().unwrap();
        assert!(req.headers().get("content-type").is_some());
        assert!(req.headers().get("cookie").is_none());
    }

    #[test]
    fn defaults_anthropic_version_when_absent() {
        let headers = HeaderMap::new();
        let client = reqwest::Client::new();
        let req = forward_headers(client.post("http://example.invalid"), &headers).build().unwrap();
        assert_eq!(req.headers().get("anthropic-version").unwrap(), DEFAULT_ANTHROPIC_VERSION);
    }

    #[test]
    fn preserves_client_anthropic_version() {
        let mut headers = HeaderMap::new();
        headers.insert("anthropic-version", HeaderValue::from_static("2024-01-01"));
        let client = reqwest::Client::new();
        let req = forward_headers(client.post("http://example.invalid"), &headers).build().unwrap();
        assert_eq!(req.headers().get("anthropic-version").unwrap(), "2024-01-01");
    }

    #[test]
    fn x_api_key_and_authorization_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("sk-ant-test"));
        headers.insert("authorization", HeaderValue::from_static("Bearer test"));
        let client = reqwest::Client::new();
        let req = forward_headers(client.post("http://example.invalid"), &headers).build().unwrap();
        assert!(req.headers().get("x-api-key").is_some());
        assert!(req.headers().get("authorization").is_some());
    }
}
