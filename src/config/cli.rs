use std::path::PathBuf;

use clap::{Parser, builder::BoolishValueParser};

/// Command-line arguments for the routecache binary.
#[derive(Debug, Parser, Default)]
#[command(
    name = "routecache",
    version,
    about = "Caching reverse proxy with per-route lifetimes"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "ROUTECACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the upstream origin URL.
    #[arg(long = "upstream-url", value_name = "URL")]
    pub upstream_url: Option<String>,

    /// Override the upstream request timeout.
    #[arg(long = "upstream-timeout-seconds", value_name = "SECONDS")]
    pub upstream_timeout_seconds: Option<u64>,

    /// Override the cache directory.
    #[arg(long = "cache-path", value_name = "PATH")]
    pub cache_path: Option<PathBuf>,

    /// Override the maximum entry lifetime.
    #[arg(long = "cache-max-expiry", value_name = "SECONDS")]
    pub cache_max_expiry: Option<i64>,

    /// Override the sweep interval.
    #[arg(long = "cache-cleanup", value_name = "SECONDS")]
    pub cache_cleanup: Option<i64>,

    /// Toggle the `Cache-Status` diagnostic header.
    #[arg(
        long = "cache-status-header",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_status_header: Option<bool>,

    /// Ignore `Cache-Control` and cache by path rules.
    #[arg(
        long = "cache-skip-cache-control-header",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_skip_cache_control_header: Option<bool>,

    /// Override the fallback lifetime used when no path rule matches.
    #[arg(long = "cache-default-ttl", value_name = "SECONDS")]
    pub cache_default_ttl: Option<i64>,
}
