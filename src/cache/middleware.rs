//! Response cache middleware.
//!
//! Serves live entries straight from the store. On a miss the request goes
//! to the inner service; if the response head is admitted by the policy its
//! body is captured while it streams and written to the store once it
//! completes. `HEAD` responses carry no body and are stored from the head.

use std::{sync::Arc, time::Duration, time::SystemTime};

use axum::{
    body::Body,
    extract::State,
    http::{
        HeaderName, HeaderValue, Method, Request, Response as HttpResponse,
        header::CACHE_CONTROL,
    },
    middleware::Next,
    response::Response,
};
use bytes::Bytes;
use metrics::counter;
use time::OffsetDateTime;
use tracing::{debug, instrument, warn};

use super::{
    CacheConfig, CacheStore,
    capture::{CaptureBody, CapturedResponse, METRIC_SKIP},
    entry::{self, CacheEntry},
    keys::CacheKey,
    policy::{Admission, CachePolicy, SkipReason},
};

/// Diagnostic response header reporting the lookup outcome.
pub const CACHE_STATUS: HeaderName = HeaderName::from_static("cache-status");

const METRIC_HIT: &str = "routecache_hit_total";
const METRIC_MISS: &str = "routecache_miss_total";
const METRIC_DECODE_ERROR: &str = "routecache_decode_error_total";
const METRIC_STORE: &str = "routecache_store_total";
const METRIC_STORE_ERROR: &str = "routecache_store_error_total";

/// Outcome of the store lookup for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    /// An entry existed but could not be decoded; handled as a miss.
    Error,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Error => "error",
        }
    }

    fn header_value(&self) -> HeaderValue {
        HeaderValue::from_static(self.as_str())
    }
}

/// Shared state for [`response_cache_layer`].
#[derive(Clone)]
pub struct CacheState {
    pub config: Arc<CacheConfig>,
    pub store: Arc<dyn CacheStore>,
    pub policy: Arc<CachePolicy>,
}

impl CacheState {
    pub fn new(config: Arc<CacheConfig>, store: Arc<dyn CacheStore>) -> Self {
        let policy = Arc::new(CachePolicy::new(&config));
        Self {
            config,
            store,
            policy,
        }
    }

    /// Look `key` up. A stored entry that fails to decode, or whose own
    /// expiry has passed, never produces a hit.
    async fn lookup(&self, key: &CacheKey) -> Result<CacheEntry, CacheStatus> {
        let Some(raw) = self.store.get(key.as_str()).await else {
            return Err(CacheStatus::Miss);
        };

        match entry::decode(&raw) {
            Ok(entry) if !entry.is_expired(OffsetDateTime::now_utc()) => Ok(entry),
            Ok(_) => Err(CacheStatus::Miss),
            Err(err) => {
                warn!(
                    target = "routecache::cache::middleware",
                    op = "cache::lookup",
                    result = "decode_error",
                    key = %key,
                    error = %err,
                    "Stored cache entry is unreadable; treating as miss"
                );
                counter!(METRIC_DECODE_ERROR).increment(1);
                Err(CacheStatus::Error)
            }
        }
    }

    fn serve_hit(&self, entry: CacheEntry) -> Response {
        let max_age = entry.max_age_header(OffsetDateTime::now_utc());
        let mut response = entry.into_response();

        if self.config.add_status_header {
            let headers = response.headers_mut();
            headers.insert(CACHE_STATUS, CacheStatus::Hit.header_value());
            if let Ok(value) = HeaderValue::from_str(&max_age) {
                headers.insert(CACHE_CONTROL, value);
            }
        }
        response
    }

    /// Snapshot, encode and persist a fully captured response.
    async fn store_captured(self, key: CacheKey, ttl: Duration, captured: CapturedResponse) {
        let expires_at = OffsetDateTime::now_utc() + ttl;
        let snapshot = match CacheEntry::from_parts(
            captured.status,
            &captured.headers,
            captured.body,
            expires_at,
        ) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                debug!(
                    target = "routecache::cache::middleware",
                    op = "cache::store",
                    result = "skipped",
                    key = %key,
                    error = %err,
                    "Response cannot be represented as a cache entry"
                );
                counter!(METRIC_SKIP, "reason" => SkipReason::Unrepresentable.as_str())
                    .increment(1);
                return;
            }
        };

        let encoded = match entry::encode(&snapshot) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(
                    target = "routecache::cache::middleware",
                    op = "cache::store",
                    result = "error",
                    key = %key,
                    error = %err,
                    "Failed to encode cache entry"
                );
                counter!(METRIC_STORE_ERROR).increment(1);
                return;
            }
        };

        match self.store.set(key.as_str(), Bytes::from(encoded), ttl).await {
            Ok(()) => {
                counter!(METRIC_STORE).increment(1);
                debug!(
                    target = "routecache::cache::middleware",
                    op = "cache::store",
                    result = "ok",
                    key = %key,
                    ttl_secs = ttl.as_secs(),
                    "Stored response"
                );
            }
            Err(err) => {
                counter!(METRIC_STORE_ERROR).increment(1);
                warn!(
                    target = "routecache::cache::middleware",
                    op = "cache::store",
                    result = "error",
                    key = %key,
                    error = %err,
                    "Failed to write cache entry"
                );
            }
        }
    }
}

/// Middleware wrapping an upstream handler with the response cache.
///
/// Install with `axum::middleware::from_fn_with_state(state, response_cache_layer)`.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(cache): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let key = CacheKey::from_request(&request);
    let status = match cache.lookup(&key).await {
        Ok(entry) => {
            debug!(cache = "response", outcome = "hit", "serving cached response");
            counter!(METRIC_HIT).increment(1);
            return cache.serve_hit(entry);
        }
        Err(status) => status,
    };

    debug!(cache = "response", outcome = status.as_str(), "executing upstream");
    counter!(METRIC_MISS).increment(1);

    if !cache.config.allows_method(request.method()) {
        debug!(cache = "response", outcome = "bypass", "method not cacheable");
        counter!(METRIC_SKIP, "reason" => SkipReason::MethodNotAllowed.as_str()).increment(1);
        let response = next.run(request).await;
        return with_status(&cache, response, status);
    }

    let request_head = request_head(&request);
    let response = next.run(request).await;
    let (parts, body) = response.into_parts();

    let response_head = {
        let mut head = HttpResponse::new(());
        *head.status_mut() = parts.status;
        *head.version_mut() = parts.version;
        *head.headers_mut() = parts.headers.clone();
        head
    };

    let body = match cache
        .policy
        .evaluate(&request_head, &response_head, SystemTime::now())
    {
        Admission::Store { ttl } if request_head.method() == Method::HEAD => {
            // The server drops a HEAD body unread; store the head alone.
            let captured = CapturedResponse {
                status: parts.status,
                headers: response_head.into_parts().0.headers,
                body: Bytes::new(),
            };
            cache.clone().store_captured(key, ttl, captured).await;
            body
        }
        Admission::Store { ttl } => {
            let state = cache.clone();
            let captured_status = parts.status;
            let captured_headers = response_head.into_parts().0.headers;
            Body::new(CaptureBody::new(
                body,
                captured_status,
                captured_headers,
                cache.config.max_body_bytes,
                move |captured| state.store_captured(key, ttl, captured),
            ))
        }
        Admission::Skip(reason) => {
            debug!(
                cache = "response",
                outcome = "skip",
                reason = reason.as_str(),
                "response not cacheable"
            );
            counter!(METRIC_SKIP, "reason" => reason.as_str()).increment(1);
            body
        }
    };

    with_status(&cache, Response::from_parts(parts, body), status)
}

fn with_status(cache: &CacheState, mut response: Response, status: CacheStatus) -> Response {
    if cache.config.add_status_header {
        response
            .headers_mut()
            .insert(CACHE_STATUS, status.header_value());
    }
    response
}

/// Body-less copy of the request used for policy evaluation after the
/// request itself has been handed to the inner service.
fn request_head(request: &Request<Body>) -> Request<()> {
    let mut head = Request::new(());
    *head.method_mut() = request.method().clone();
    *head.uri_mut() = request.uri().clone();
    *head.version_mut() = request.version();
    *head.headers_mut() = request.headers().clone();
    head
}
