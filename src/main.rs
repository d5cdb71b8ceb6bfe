//! hproxy - caching HTTP proxy

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use hproxy::{
    cli::{Cli, Command, FetchArgs, ServeArgs},
    client::ProxyClient,
    config::Config,
    gateway::ProxyServer,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Fetch(args)) => run_fetch(args).await,
        Some(Command::Serve) | None => run_server(cli.serve).await,
    }
}

/// Fetch a URL through a running proxy
async fn run_fetch(args: FetchArgs) -> ExitCode {
    let client = match ProxyClient::new(&args.server) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    match client.fetch(&args.url, args.min_ttl, args.max_ttl).await {
        Ok(reply) => match serde_json::to_string_pretty(&reply) {
            Ok(json) => {
                println!("{json}");
                if reply.get("error").is_some() {
                    ExitCode::FAILURE
                } else {
                    ExitCode::SUCCESS
                }
            }
            Err(e) => {
                eprintln!("❌ Failed to serialize reply: {e}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the proxy server
async fn run_server(args: ServeArgs) -> ExitCode {
    // Load configuration
    let config = match Config::load(args.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(port) = args.port {
                config.server.port = port;
            }
            if let Some(host) = args.host {
                config.server.host = host;
            }
            if let Some(url) = args.store_url {
                config.store.url = Some(url);
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        workers = config.cache.workers,
        "Starting hproxy"
    );

    let server = match ProxyServer::connect(config).await {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to start proxy: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run().await {
        error!("Proxy error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
