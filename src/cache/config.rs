//! Cache configuration.
//!
//! `RawCacheConfig` is the shape read from `routecache.toml` (`[cache]`
//! table) or any other source; `CacheConfig` is the validated, immutable
//! form handed to the store, the policy and the middleware.

use std::{path::PathBuf, time::Duration};

use axum::http::Method;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

// Defaults mirror the plugin this cache replaces.
const DEFAULT_PATH: &str = "cache";
const DEFAULT_MAX_EXPIRY_SECS: i64 = 300;
const DEFAULT_CLEANUP_SECS: i64 = 300;
const DEFAULT_MAX_BODY_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_ALLOWED_METHODS: [&str; 2] = ["GET", "HEAD"];

/// Unvalidated cache settings as deserialized from configuration sources.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawCacheConfig {
    /// Directory holding cache files.
    pub path: PathBuf,
    /// Upper bound on any entry lifetime, in seconds (>= 1).
    pub max_expiry: i64,
    /// Interval between background sweeps, in seconds (>= 1).
    pub cleanup: i64,
    /// Emit the `Cache-Status` diagnostic header.
    pub add_status_header: bool,
    /// Methods whose responses may be written to the cache.
    pub allowed_http_methods: Vec<String>,
    /// Ignore `Cache-Control` and use `uris` / `default_ttl` instead.
    pub skip_cache_control_header: bool,
    /// Fallback lifetime in seconds when no rule matches; 0 disables it.
    pub default_ttl: i64,
    /// Path pattern rules, evaluated in declaration order.
    pub uris: Vec<RawUriRule>,
    /// Largest body that will be captured for caching.
    pub max_body_bytes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawUriRule {
    pub pattern: String,
    pub ttl: i64,
}

impl Default for RawCacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_PATH),
            max_expiry: DEFAULT_MAX_EXPIRY_SECS,
            cleanup: DEFAULT_CLEANUP_SECS,
            add_status_header: true,
            allowed_http_methods: DEFAULT_ALLOWED_METHODS
                .iter()
                .map(|method| method.to_string())
                .collect(),
            skip_cache_control_header: false,
            default_ttl: 0,
            uris: Vec::new(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheConfigError {
    #[error("invalid cache configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl CacheConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// A compiled override rule: requests whose path matches `pattern` are
/// cached for `ttl` when cache-control interpretation is disabled.
#[derive(Debug, Clone)]
pub struct UriRule {
    pub pattern: Regex,
    pub ttl: Duration,
}

/// Validated cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub path: PathBuf,
    pub max_expiry: Duration,
    pub cleanup_interval: Duration,
    pub add_status_header: bool,
    pub allowed_methods: Vec<Method>,
    pub skip_cache_control_header: bool,
    pub default_ttl: Duration,
    pub uris: Vec<UriRule>,
    pub max_body_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_PATH),
            max_expiry: Duration::from_secs(DEFAULT_MAX_EXPIRY_SECS as u64),
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_SECS as u64),
            add_status_header: true,
            allowed_methods: vec![Method::GET, Method::HEAD],
            skip_cache_control_header: false,
            default_ttl: Duration::ZERO,
            uris: Vec::new(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES as usize,
        }
    }
}

impl TryFrom<RawCacheConfig> for CacheConfig {
    type Error = CacheConfigError;

    fn try_from(raw: RawCacheConfig) -> Result<Self, Self::Error> {
        if raw.path.as_os_str().is_empty() {
            return Err(CacheConfigError::invalid("cache.path", "path must not be empty"));
        }
        if raw.max_expiry < 1 {
            return Err(CacheConfigError::invalid(
                "cache.max_expiry",
                "must be greater or equal to 1",
            ));
        }
        if raw.cleanup < 1 {
            return Err(CacheConfigError::invalid(
                "cache.cleanup",
                "must be greater or equal to 1",
            ));
        }
        if raw.max_body_bytes == 0 {
            return Err(CacheConfigError::invalid(
                "cache.max_body_bytes",
                "must be greater than zero",
            ));
        }
        let max_body_bytes = usize::try_from(raw.max_body_bytes).map_err(|_| {
            CacheConfigError::invalid(
                "cache.max_body_bytes",
                "value exceeds supported range for usize",
            )
        })?;

        let allowed_methods = raw
            .allowed_http_methods
            .iter()
            .map(|name| {
                let name = name.trim().to_ascii_uppercase();
                Method::from_bytes(name.as_bytes()).map_err(|_| {
                    CacheConfigError::invalid(
                        "cache.allowed_http_methods",
                        format!("`{name}` is not a valid HTTP method"),
                    )
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            path: raw.path,
            max_expiry: seconds(raw.max_expiry),
            cleanup_interval: seconds(raw.cleanup),
            add_status_header: raw.add_status_header,
            allowed_methods,
            skip_cache_control_header: raw.skip_cache_control_header,
            default_ttl: seconds(raw.default_ttl),
            uris: compile_rules(&raw.uris),
            max_body_bytes,
        })
    }
}

impl CacheConfig {
    /// Whether responses to `method` may be written to the cache.
    pub fn allows_method(&self, method: &Method) -> bool {
        self.allowed_methods.contains(method)
    }
}

/// Compile rules in declaration order. A pattern that fails to compile is
/// skipped with a warning; the remaining rules are kept.
fn compile_rules(rules: &[RawUriRule]) -> Vec<UriRule> {
    rules
        .iter()
        .filter_map(|rule| match Regex::new(&rule.pattern) {
            Ok(pattern) => Some(UriRule {
                pattern,
                ttl: seconds(rule.ttl),
            }),
            Err(err) => {
                warn!(
                    target = "routecache::cache::config",
                    op = "config::compile_rules",
                    result = "skipped",
                    pattern = %rule.pattern,
                    error = %err,
                    "Skipping cache rule with invalid pattern"
                );
                None
            }
        })
        .collect()
}

/// Non-positive second counts become a zero duration.
fn seconds(value: i64) -> Duration {
    Duration::from_secs(u64::try_from(value).unwrap_or(0))
}
