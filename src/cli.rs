//! Command-line interface

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

/// Caching HTTP proxy with stale-while-revalidate semantics
#[derive(Parser, Debug)]
#[command(name = "hproxy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "HPROXY_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "HPROXY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Server options
    #[command(flatten)]
    pub serve: ServeArgs,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the proxy server (default)
    Serve,

    /// Fetch a URL through a running proxy and print the reply
    Fetch(FetchArgs),
}

/// Server options, accepted before or after `serve`
#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "HPROXY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Redis URL of the backing store
    #[arg(long, env = "REDIS_URI", global = true)]
    pub store_url: Option<String>,
}

/// Arguments for `fetch`
#[derive(clap::Args, Debug)]
pub struct FetchArgs {
    /// URL to fetch
    #[arg(long, default_value = "https://httpbin.org/get")]
    pub url: String,

    /// Age below which a cached response is served as-is
    #[arg(long = "min_ttl", default_value = "1h", value_parser = humantime::parse_duration)]
    pub min_ttl: Duration,

    /// Age beyond which a cached response is never served
    #[arg(long = "max_ttl", default_value = "24h", value_parser = humantime::parse_duration)]
    pub max_ttl: Duration,

    /// Proxy address
    #[arg(long, default_value = "http://localhost:8080")]
    pub server: String,
}
