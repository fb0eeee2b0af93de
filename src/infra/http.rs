use axum::{Router, http::StatusCode, middleware, routing::get};

use crate::cache::{CacheState, response_cache_layer};

use super::upstream::{UpstreamProxy, proxy_handler};

/// Liveness probe served by the proxy itself, never cached or forwarded.
pub const HEALTH_PATH: &str = "/_routecache/health";

/// Wrap `router` (routes and fallback) with the response cache.
pub fn with_cache<S>(router: Router<S>, cache: CacheState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(middleware::from_fn_with_state(cache, response_cache_layer))
}

/// Proxy router: every request except the health probe goes through the
/// cache to the upstream origin.
pub fn build_router(proxy: UpstreamProxy, cache: CacheState) -> Router {
    let cached_routes = with_cache(Router::new().fallback(proxy_handler), cache).with_state(proxy);

    Router::new()
        .route(HEALTH_PATH, get(health))
        .merge(cached_routes)
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}
