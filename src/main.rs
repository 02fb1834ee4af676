//! ChainArb partition service entry point.
//!
//! One process handles one partition (a named subset of chains): it ingests
//! that partition's price/whale streams, runs the cross-chain detector, and
//! participates in leadership election and cross-region failover.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chainarb_backend::api;
use chainarb_backend::config::{partition_preset, Config};
use chainarb_backend::service::PartitionService;
use chainarb_backend::stream::memory::MemoryTransport;
use chainarb_backend::stream::redis::RedisStreamTransport;
use chainarb_backend::stream::StreamTransport;
use chainarb_backend::util::backoff::Backoff;

#[derive(Parser, Debug)]
#[command(name = "chainarb", about = "Cross-chain DEX arbitrage detector")]
struct Cli {
    /// Partition to run (overrides PARTITION_ID).
    #[arg(long)]
    partition: Option<String>,

    /// HTTP port (overrides HEALTH_CHECK_PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Run against an in-process transport instead of Redis (local dev).
    #[arg(long)]
    standalone: bool,
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    let cli = Cli::parse();

    let filter = std::env::var("LOG_LEVEL")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    if let Err(e) = run(cli).await {
        error!(error = ?e, "Fatal startup error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    if cli.standalone && std::env::var("REDIS_URL").is_err() {
        // Standalone mode never dials out; satisfy config with a marker URL.
        std::env::set_var("REDIS_URL", "memory://standalone");
    }

    let mut config = Config::from_env().context("invalid configuration")?;
    if let Some(partition_id) = &cli.partition {
        config.partition = partition_preset(partition_id)
            .with_context(|| format!("unknown partition '{}'", partition_id))?;
    }
    if let Some(port) = cli.port {
        config.health_check_port = port;
    }

    let transport: Arc<dyn StreamTransport> = if cli.standalone {
        info!("Standalone mode: using in-process stream transport");
        Arc::new(MemoryTransport::new())
    } else {
        Arc::new(connect_with_retry(&config.redis_url).await?)
    };

    let service = PartitionService::build(config.clone(), transport);
    service.start().await?;

    let router = api::router(service.api_state());
    let addr = format!("0.0.0.0:{}", config.health_check_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(addr = %addr, "HTTP surface listening");

    let serve = axum::serve(listener, router).with_graceful_shutdown(shutdown_signal());
    let result = serve.await;

    service.stop().await;
    result.context("HTTP server error")
}

async fn connect_with_retry(url: &str) -> Result<RedisStreamTransport> {
    let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 10);
    loop {
        match RedisStreamTransport::connect(url).await {
            Ok(transport) => return Ok(transport),
            Err(e) if !backoff.exhausted() => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    attempt = backoff.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Stream transport connection failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(e).context("stream transport unreachable after retry budget");
            }
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install shutdown handler");
    }
    info!("Shutdown signal received");
}
