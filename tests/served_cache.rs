use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    body::Body,
    http::{Method, Request, header::CACHE_CONTROL},
    routing::get,
};
use routecache::{
    cache::{CACHE_STATUS, CacheConfig, CacheState, FileStore},
    infra::http::with_cache,
};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tower::ServiceExt;

struct Served {
    _dir: TempDir,
    store: FileStore,
    app: Router,
    calls: Arc<AtomicUsize>,
}

async fn cached_app() -> Served {
    let dir = TempDir::new().expect("temp dir");
    let store = FileStore::open(dir.path(), Duration::from_secs(300))
        .await
        .expect("open store");
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let upstream = Router::new().route(
        "/fixed",
        get(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { ([(CACHE_CONTROL, "max-age=60")], "fixed length body") }
        }),
    );
    let state = CacheState::new(Arc::new(CacheConfig::default()), Arc::new(store.clone()));

    Served {
        _dir: dir,
        store,
        app: with_cache(upstream, state),
        calls,
    }
}

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server");
    });
    addr
}

fn cache_status(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(CACHE_STATUS.as_str())
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

#[tokio::test]
async fn content_length_response_is_cached_by_a_running_server() {
    let served = cached_app().await;
    let addr = serve(served.app.clone()).await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/fixed");

    let mut statuses = Vec::new();
    for _ in 0..3 {
        let response = client.get(&url).send().await.expect("response");
        assert!(response.content_length().is_some());
        statuses.push(cache_status(&response));
        let body = response.text().await.expect("body");
        assert_eq!(body, "fixed length body");
    }

    assert_eq!(
        statuses,
        vec![
            Some("miss".to_owned()),
            Some("hit".to_owned()),
            Some("hit".to_owned())
        ]
    );
    assert_eq!(served.calls.load(Ordering::SeqCst), 1);
    assert_eq!(served.store.len().await.expect("len"), 1);
}

#[tokio::test]
async fn head_response_is_cached_by_a_running_server() {
    let served = cached_app().await;
    let addr = serve(served.app.clone()).await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/fixed");

    let first = client.head(&url).send().await.expect("response");
    assert_eq!(cache_status(&first).as_deref(), Some("miss"));

    let second = client.head(&url).send().await.expect("response");
    assert_eq!(cache_status(&second).as_deref(), Some("hit"));

    assert_eq!(served.calls.load(Ordering::SeqCst), 1);
    assert_eq!(served.store.len().await.expect("len"), 1);
}

#[tokio::test]
async fn response_dropped_unread_is_still_stored() {
    let served = cached_app().await;

    let request = Request::builder()
        .method(Method::GET)
        .uri("/fixed")
        .header("host", "served.test")
        .body(Body::empty())
        .expect("request should build");
    let response = served.app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.headers()[CACHE_STATUS], "miss");
    drop(response);

    let mut stored = 0;
    for _ in 0..100 {
        stored = served.store.len().await.expect("len");
        if stored == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stored, 1);
}
