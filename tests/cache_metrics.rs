use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header::CACHE_CONTROL},
    routing::get,
};
use bytes::Bytes;
use http_body_util::BodyExt;
use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use routecache::{
    cache::{CacheConfig, CacheKey, CacheState, CacheStore, FileStore},
    infra::{http::with_cache, telemetry},
};
use tempfile::TempDir;
use tower::ServiceExt;

#[tokio::test]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    let dir = TempDir::new().expect("temp dir");
    let store = FileStore::open(dir.path(), Duration::from_secs(300))
        .await
        .expect("open store");
    let config = CacheConfig {
        max_body_bytes: 32,
        ..Default::default()
    };
    let cache_state = CacheState::new(Arc::new(config), Arc::new(store.clone()));

    let app = with_cache(
        Router::new()
            .route(
                "/fresh",
                get(|| async { ([(CACHE_CONTROL, "max-age=60")], "fresh") }),
            )
            .route(
                "/private",
                get(|| async { ([(CACHE_CONTROL, "private")], "mine") }),
            )
            .route(
                "/big",
                get(|| async { ([(CACHE_CONTROL, "max-age=60")], "y".repeat(128)) }),
            )
            .route(
                "/broken",
                get(|| async { ([(CACHE_CONTROL, "max-age=60")], "repaired") }),
            ),
        cache_state,
    );

    store
        .set(
            CacheKey::new("GET", "metrics.test", "/broken").as_str(),
            Bytes::from_static(b"garbage"),
            Duration::from_secs(60),
        )
        .await
        .expect("seed corrupt entry");

    let requests = [
        (Method::GET, "/fresh"),
        (Method::GET, "/fresh"),
        (Method::GET, "/private"),
        (Method::GET, "/big"),
        (Method::GET, "/broken"),
        (Method::DELETE, "/fresh"),
    ];
    for (method, uri) in requests {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("host", "metrics.test")
            .body(Body::empty())
            .expect("request should build");
        let response = app
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond");
        let status = response.status();
        response.into_body().collect().await.expect("body");
        assert!(status == StatusCode::OK || status == StatusCode::METHOD_NOT_ALLOWED);
    }

    store.remove_expired().await.expect("sweep");

    let snapshot = snapshotter.snapshot().into_vec();
    let names: HashSet<String> = snapshot
        .iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "routecache_hit_total",
        "routecache_miss_total",
        "routecache_decode_error_total",
        "routecache_store_total",
        "routecache_skip_total",
    ];
    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }

    let mut skips: HashMap<String, u64> = HashMap::new();
    for (composite_key, _, _, value) in &snapshot {
        let key = composite_key.key();
        if key.name() != "routecache_skip_total" {
            continue;
        }
        let reason = key
            .labels()
            .find(|label| label.key() == "reason")
            .map(|label| label.value().to_string())
            .expect("reason label");
        if let DebugValue::Counter(count) = value {
            *skips.entry(reason).or_default() += count;
        }
    }

    assert_eq!(skips.get("uncacheable"), Some(&1));
    assert_eq!(skips.get("body_too_large"), Some(&1));
    assert_eq!(skips.get("method_not_allowed"), Some(&1));
}
