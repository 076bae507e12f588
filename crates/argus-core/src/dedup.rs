//! Deduplication-key derivation for in-flight request identity.
//!
//! A post URL identifies the same post regardless of tracking parameters,
//! so keys are derived from a canonical form of the URL when it parses,
//! falling back to a hash of the payload.

use sha2::{Digest, Sha256};
use url::Url;

use crate::traits::TransportRequest;

/// Canonical form of a post URL: scheme + lowercased host + path, with
/// query, fragment, and trailing slash stripped.
///
/// Example: `"HTTPS://Mastodon.Social/@a/1?utm=x#top"` →
/// `"https://mastodon.social/@a/1"`.
pub fn canonical_post_url(url_str: &str) -> Option<String> {
    let url = Url::parse(url_str).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    let path = url.path().trim_end_matches('/');
    Some(format!("{}://{}{}", url.scheme(), host, path))
}

/// SHA-256 hex of a payload's canonical JSON serialization.
pub fn payload_key(payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Dedup key for an upstream exchange: method + canonical URL, plus a
/// payload hash when a body is present.
pub fn request_key(request: &TransportRequest) -> String {
    let url = canonical_post_url(&request.url).unwrap_or_else(|| request.url.clone());
    match &request.body {
        Some(body) => format!("{}:{}:{}", request.method, url, payload_key(body)),
        None => format!("{}:{}", request.method, url),
    }
}
