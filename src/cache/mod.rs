//! Route-aware HTTP response cache.
//!
//! The cache wraps an upstream handler as axum middleware. Responses are
//! admitted either by standard shared-cache semantics or, when
//! `skip_cache_control_header` is set, by path rules with fixed lifetimes;
//! every lifetime is bounded by `max_expiry`. Entries live on disk and
//! survive restarts.
//!
//! ```toml
//! [cache]
//! path = "cache"
//! max_expiry = 300
//! cleanup = 300
//! add_status_header = true
//! allowed_http_methods = ["GET", "HEAD"]
//! skip_cache_control_header = false
//! default_ttl = 0
//! uris = [{ pattern = "^/api/", ttl = 30 }]
//! ```

mod capture;
mod config;
mod entry;
mod keys;
mod lock;
mod middleware;
mod policy;
mod store;

pub use capture::{CaptureBody, CapturedResponse};
pub use config::{CacheConfig, CacheConfigError, RawCacheConfig, RawUriRule, UriRule};
pub use entry::{CacheEntry, EntryError, HeaderList, decode, encode};
pub use keys::CacheKey;
pub use middleware::{CACHE_STATUS, CacheState, CacheStatus, response_cache_layer};
pub use policy::{Admission, CachePolicy, SkipReason};
pub use store::{CacheStore, FileStore, StoreError};
