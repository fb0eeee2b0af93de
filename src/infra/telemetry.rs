use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the cache emits. Idempotent.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "routecache_hit_total",
            Unit::Count,
            "Requests answered from the response cache."
        );
        describe_counter!(
            "routecache_miss_total",
            Unit::Count,
            "Requests forwarded upstream after a cache lookup."
        );
        describe_counter!(
            "routecache_decode_error_total",
            Unit::Count,
            "Stored entries that could not be decoded and were treated as misses."
        );
        describe_counter!(
            "routecache_store_total",
            Unit::Count,
            "Responses written to the cache."
        );
        describe_counter!(
            "routecache_skip_total",
            Unit::Count,
            "Responses not written to the cache, labelled by reason."
        );
        describe_counter!(
            "routecache_store_error_total",
            Unit::Count,
            "Cache writes that failed."
        );
        describe_histogram!(
            "routecache_sweep_removed",
            Unit::Count,
            "Expired entries removed per background sweep."
        );
    });
}
