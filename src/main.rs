use std::{process, sync::Arc, time::Duration};

use routecache::{
    cache::{CacheState, FileStore},
    config::{self, Settings},
    infra::{
        error::{AppError, InfraError},
        http,
        telemetry,
        upstream::UpstreamProxy,
    },
};
use tokio::net::TcpListener;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (_, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging)?;

    let store = FileStore::open(&settings.cache.path, settings.cache.cleanup_interval).await?;
    info!(
        target = "routecache::serve",
        path = %store.dir().display(),
        max_expiry_secs = settings.cache.max_expiry.as_secs(),
        cleanup_secs = settings.cache.cleanup_interval.as_secs(),
        override_mode = settings.cache.skip_cache_control_header,
        rules = settings.cache.uris.len(),
        "Opened cache store"
    );

    let result = serve_http(&settings, store.clone()).await;

    store.shutdown();
    result
}

async fn serve_http(settings: &Settings, store: FileStore) -> Result<(), AppError> {
    let proxy = UpstreamProxy::new(&settings.upstream)?;
    let cache = CacheState::new(Arc::new(settings.cache.clone()), Arc::new(store));
    let router = http::build_router(proxy, cache);

    let listener = TcpListener::bind(settings.server.addr)
        .await
        .map_err(InfraError::from)?;
    info!(
        target = "routecache::serve",
        addr = %settings.server.addr,
        upstream = %settings.upstream.url,
        "Listening"
    );

    let grace = settings.server.graceful_shutdown;
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal(grace))
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    info!(target = "routecache::serve", "Server stopped");
    Ok(())
}

/// Resolves on Ctrl-C. Once the signal arrives, connections get `grace` to
/// drain before the process exits regardless.
async fn shutdown_signal(grace: Duration) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(
            target = "routecache::serve",
            error = %err,
            "Failed to listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }

    info!(
        target = "routecache::serve",
        grace_secs = grace.as_secs(),
        "Shutdown requested; draining connections"
    );
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        warn!(
            target = "routecache::serve",
            "Graceful shutdown timed out; exiting"
        );
        process::exit(0);
    });
}
