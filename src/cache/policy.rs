//! Cacheability policy.
//!
//! Decides, once the upstream response is known, whether it may be stored
//! and for how long. Two modes exist:
//!
//! - **standard**: shared-cache HTTP semantics (`no-store`, `private`,
//!   `Authorization`, status and method rules, freshness lifetime) via
//!   `http-cache-semantics`;
//! - **override**: response cache headers are ignored and the request path
//!   is matched against the configured rules in declaration order, with
//!   the default TTL as fallback.
//!
//! Either way the lifetime is clamped to the configured maximum.

use std::time::{Duration, SystemTime};

use axum::http::{HeaderMap, Request, Response, header::CACHE_CONTROL};
use http_cache_semantics::{CacheOptions, CachePolicy as HttpCachePolicy};

use super::config::{CacheConfig, UriRule};

/// Why a response was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Standard semantics forbid storing the response.
    Uncacheable,
    /// A `Cache-Control` header could not be interpreted.
    MalformedCacheControl,
    /// Override mode: no rule matched and no default TTL is set.
    NoMatchingRule,
    /// The lifetime is zero after clamping.
    NoLifetime,
    /// The request method is not in the allow-list.
    MethodNotAllowed,
    /// The body exceeded the capture limit.
    BodyTooLarge,
    /// The response cannot be represented as a cache entry.
    Unrepresentable,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uncacheable => "uncacheable",
            Self::MalformedCacheControl => "malformed_cache_control",
            Self::NoMatchingRule => "no_matching_rule",
            Self::NoLifetime => "no_lifetime",
            Self::MethodNotAllowed => "method_not_allowed",
            Self::BodyTooLarge => "body_too_large",
            Self::Unrepresentable => "unrepresentable",
        }
    }
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Store { ttl: Duration },
    Skip(SkipReason),
}

#[derive(Debug, Clone)]
pub struct CachePolicy {
    override_mode: bool,
    rules: Vec<UriRule>,
    default_ttl: Duration,
    max_expiry: Duration,
}

impl CachePolicy {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            override_mode: config.skip_cache_control_header,
            rules: config.uris.clone(),
            default_ttl: config.default_ttl,
            max_expiry: config.max_expiry,
        }
    }

    /// Evaluate body-less request/response heads at `now`.
    ///
    /// Does not look at the method allow-list; the middleware checks that
    /// before capturing.
    pub fn evaluate(
        &self,
        request: &Request<()>,
        response: &Response<()>,
        now: SystemTime,
    ) -> Admission {
        let candidate = if self.override_mode {
            match self.rule_ttl(request.uri().path()) {
                Some(ttl) => ttl,
                None => return Admission::Skip(SkipReason::NoMatchingRule),
            }
        } else {
            match standard_lifetime(request, response, now) {
                Ok(ttl) => ttl,
                Err(reason) => return Admission::Skip(reason),
            }
        };

        self.clamp(candidate)
    }

    /// Bound a candidate lifetime by the configured maximum. Anything below
    /// one millisecond afterwards is not worth storing.
    pub fn clamp(&self, candidate: Duration) -> Admission {
        let ttl = candidate.min(self.max_expiry);
        if ttl.as_millis() == 0 {
            Admission::Skip(SkipReason::NoLifetime)
        } else {
            Admission::Store { ttl }
        }
    }

    /// First rule (in declaration order) matching `path`, else the default
    /// TTL when it is non-zero.
    fn rule_ttl(&self, path: &str) -> Option<Duration> {
        if let Some(rule) = self.rules.iter().find(|rule| rule.pattern.is_match(path)) {
            return Some(rule.ttl);
        }
        (!self.default_ttl.is_zero()).then_some(self.default_ttl)
    }
}

fn standard_lifetime(
    request: &Request<()>,
    response: &Response<()>,
    now: SystemTime,
) -> Result<Duration, SkipReason> {
    if has_malformed_cache_control(request.headers())
        || has_malformed_cache_control(response.headers())
    {
        return Err(SkipReason::MalformedCacheControl);
    }

    let policy = HttpCachePolicy::new_options(request, response, now, CacheOptions::default());
    if !policy.is_storable() {
        return Err(SkipReason::Uncacheable);
    }

    Ok(policy.time_to_live(now))
}

/// A `Cache-Control` value is malformed when it is not visible ASCII or a
/// lifetime directive carries something other than delta-seconds.
fn has_malformed_cache_control(headers: &HeaderMap) -> bool {
    headers.get_all(CACHE_CONTROL).iter().any(|value| {
        let Ok(value) = value.to_str() else {
            return true;
        };
        value.split(',').any(|directive| {
            let Some((name, argument)) = directive.split_once('=') else {
                return false;
            };
            let name = name.trim().to_ascii_lowercase();
            let argument = argument.trim().trim_matches('"');
            matches!(name.as_str(), "max-age" | "s-maxage")
                && (argument.is_empty() || !argument.bytes().all(|b| b.is_ascii_digit()))
        })
    })
}
