//! Cache key derivation.
//!
//! A key identifies a cacheable resource by method, host and path. The
//! query string and all other request headers are not part of the key, so
//! requests that differ only by query or `Accept`-style headers share one
//! entry.

use std::fmt;

use axum::http::{Request, header::HOST};
use sha2::{Digest, Sha256};

/// Deterministic identity of a cacheable request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Build the key for a request: `"{METHOD} {host}{path}"`.
    ///
    /// The host comes from the `Host` header, falling back to the URI
    /// authority (HTTP/2 requests carry it there).
    pub fn from_request<B>(request: &Request<B>) -> Self {
        let host = request
            .headers()
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .or_else(|| request.uri().authority().map(|authority| authority.as_str()))
            .unwrap_or("");

        Self::new(request.method().as_str(), host, request.uri().path())
    }

    pub fn new(method: &str, host: &str, path: &str) -> Self {
        Self(format!("{method} {host}{path}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash a key string into a file-system safe name.
pub(crate) fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}
