use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use chrono::Utc;
use clap::Parser;
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use tollgate::config::{resolve_with, EnvOverrides, LimiterConfig};
use tollgate::ratelimit::WINDOW_LENGTH_MILLIS;
use tollgate::RateLimitLayer;

/// How often expired in-process state is swept.
const EVICTION_INTERVAL: Duration = Duration::from_secs(30);

/// Demo server protecting a single endpoint with per-IP and per-token limits.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// YAML file with rate limiter settings; environment variables win over it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let input = args
        .config
        .as_deref()
        .map(LimiterConfig::from_file)
        .transpose()?;
    let overrides = EnvOverrides::from_process();
    let debug_enabled = overrides.debug_enabled(input.as_ref());

    init_tracing(debug_enabled, args.json_logs);

    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Configuration errors are fatal: never serve with a degraded limiter.
    let config = Arc::new(resolve_with(input, &overrides)?);
    info!(
        ip_max = config.ip.max_requests_per_second,
        ip_block_ms = config.ip.block_duration_millis,
        token_max = config.token.max_requests_per_second,
        token_block_ms = config.token.block_duration_millis,
        custom_tokens = config.custom_tokens.len(),
        "Configuration loaded"
    );

    let storage = config.storage.clone();
    let eviction = tokio::spawn(async move {
        let mut interval = tokio::time::interval(EVICTION_INTERVAL);
        loop {
            interval.tick().await;
            let evicted = storage.evict_expired(Utc::now(), WINDOW_LENGTH_MILLIS);
            debug!(evicted, "Eviction sweep finished");
        }
    });

    let app = Router::new()
        .route("/", get(|| async { "OK" }))
        .layer(RateLimitLayer::new(config));

    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    info!("Listening on {}", args.listen);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    eviction.abort();
    info!("Tollgate stopped");
    Ok(())
}

fn init_tracing(debug_enabled: bool, json: bool) {
    let default_directive = if debug_enabled { "info,tollgate=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
