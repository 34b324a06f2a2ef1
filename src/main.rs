//! MetaShelf Lookup Daemon
//!
//! Standalone process wiring the lookup pipeline to the Open Library API,
//! with health and status/metrics HTTP endpoints.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     MetaShelf Daemon                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌───────────┐   ┌──────────────┐   ┌───────────────────┐   │
//! │  │  Lookup   │──▶│  Dispatcher  │──▶│  Open Library API │   │
//! │  │  Service  │   │  + Limiter   │   │     (HTTP)        │   │
//! │  └───────────┘   └──────────────┘   └───────────────────┘   │
//! │        │                                                    │
//! │   local store          /healthz  /queue/status  /metrics    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use metashelf::adapters::{InMemoryStore, OpenLibraryClient};
use metashelf::domain::ports::{LocalStore, UpstreamClient};
use metashelf::error::{Error, Result};
use metashelf::service::CacheAsideLookupService;
use metashelf::{InFlightRegistry, LookupConfig, PriorityDispatcher, RateLimiter};

// =============================================================================
// CLI Arguments
// =============================================================================

/// MetaShelf - rate-limited catalog metadata lookup daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Upstream catalog API base URL
    #[arg(long, env = "UPSTREAM_BASE_URL", default_value = "https://openlibrary.org")]
    upstream_url: String,

    /// API key for the upstream catalog (if required)
    #[arg(long, env = "UPSTREAM_API_KEY")]
    api_key: Option<String>,

    /// Sustained upstream request rate (tokens per second)
    #[arg(long, env = "REQUESTS_PER_SECOND", default_value = "5.0")]
    requests_per_second: f64,

    /// Token bucket burst capacity
    #[arg(long, env = "BURST_CAPACITY", default_value = "10")]
    burst_capacity: u32,

    /// Number of dispatcher workers
    #[arg(long, env = "WORKER_COUNT", default_value = "2")]
    worker_count: usize,

    /// Maximum attempts per lookup before giving up
    #[arg(long, env = "MAX_ATTEMPTS", default_value = "3")]
    max_attempts: u32,

    /// Base retry backoff in milliseconds
    #[arg(long, env = "BACKOFF_BASE_MS", default_value = "250")]
    backoff_base_ms: u64,

    /// Retry backoff cap in seconds
    #[arg(long, env = "BACKOFF_CAP_SECONDS", default_value = "30")]
    backoff_cap_seconds: u64,

    /// Per-attempt upstream timeout in seconds
    #[arg(long, env = "ATTEMPT_TIMEOUT_SECONDS", default_value = "10")]
    attempt_timeout_seconds: u64,

    /// Disable upstream lookups (cache hits still serve)
    #[arg(long, env = "LOOKUPS_DISABLED")]
    lookups_disabled: bool,

    /// Status/metrics server bind address
    #[arg(long, env = "STATUS_ADDR", default_value = "0.0.0.0:8080")]
    status_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn to_config(&self) -> LookupConfig {
        LookupConfig {
            enabled: !self.lookups_disabled,
            api_key: self.api_key.clone(),
            base_url: self.upstream_url.clone(),
            requests_per_second: self.requests_per_second,
            burst_capacity: self.burst_capacity,
            max_attempts: self.max_attempts,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap: Duration::from_secs(self.backoff_cap_seconds),
            attempt_timeout: Duration::from_secs(self.attempt_timeout_seconds),
            worker_count: self.worker_count,
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting MetaShelf lookup daemon");
    info!("  Upstream URL: {}", args.upstream_url);
    info!("  Rate: {}/s, burst {}", args.requests_per_second, args.burst_capacity);
    info!("  Workers: {}", args.worker_count);
    info!("  Lookups enabled: {}", !args.lookups_disabled);

    let config = args.to_config();
    config.validate()?;

    // Wire the pipeline
    let limiter = Arc::new(RateLimiter::new(
        config.requests_per_second,
        config.burst_capacity,
    ));
    let registry = Arc::new(InFlightRegistry::new());
    let store: Arc<dyn LocalStore> = Arc::new(InMemoryStore::new());
    let upstream: Arc<dyn UpstreamClient> = Arc::new(OpenLibraryClient::new(&config)?);

    let dispatcher = PriorityDispatcher::new(
        config.clone(),
        Arc::clone(&limiter),
        Arc::clone(&registry),
        Arc::clone(&upstream),
    )?;
    PriorityDispatcher::start(&dispatcher);

    let service = Arc::new(CacheAsideLookupService::new(
        config,
        store,
        upstream,
        limiter,
        registry,
        Arc::clone(&dispatcher),
    )?);

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start status/metrics server
    let status_addr = args.status_addr.clone();
    let status_service = Arc::clone(&service);
    tokio::spawn(async move {
        if let Err(e) = run_status_server(&status_addr, status_service).await {
            error!("Status server error: {}", e);
        }
    });

    // Run until interrupted, then drain
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::Internal(format!("failed to listen for shutdown signal: {}", e)))?;
    info!("Shutdown signal received");

    dispatcher.drain().await;
    info!("Lookup daemon shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().expect("static directive"))
        .add_directive("reqwest=info".parse().expect("static directive"))
        .add_directive("tower=warn".parse().expect("static directive"));

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn health_handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/healthz" | "/livez" | "/readyz" => Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from("ok")))
                .unwrap(),
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("not found")))
                .unwrap(),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid health server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind health server: {}", e)))?;

    info!("Health server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Health server accept error: {}", e)))?;

        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(health_handler))
                .await
            {
                tracing::error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Status / Metrics Server
// =============================================================================

async fn run_status_server(addr: &str, service: Arc<CacheAsideLookupService>) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use prometheus::{Encoder, TextEncoder};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    // Register metrics; updated from pipeline stats on each scrape
    let queued_gauge = prometheus::register_gauge_vec!(
        "metashelf_queued_jobs",
        "Queued lookup jobs per priority lane",
        &["lane"]
    )
    .map_err(|e| Error::Internal(format!("metric registration failed: {}", e)))?;
    let in_flight_gauge = prometheus::register_gauge!(
        "metashelf_in_flight_jobs",
        "Lookup jobs currently executing an upstream call"
    )
    .map_err(|e| Error::Internal(format!("metric registration failed: {}", e)))?;
    let tokens_gauge = prometheus::register_gauge!(
        "metashelf_rate_limiter_tokens",
        "Tokens currently available in the rate limiter bucket"
    )
    .map_err(|e| Error::Internal(format!("metric registration failed: {}", e)))?;

    let handler = move |req: Request<hyper::body::Incoming>| {
        let service = Arc::clone(&service);
        let queued_gauge = queued_gauge.clone();
        let in_flight_gauge = in_flight_gauge.clone();
        let tokens_gauge = tokens_gauge.clone();
        async move {
            let response = match req.uri().path() {
                "/queue/status" => {
                    let stats = service.stats();
                    let body = serde_json::to_vec_pretty(&stats)
                        .unwrap_or_else(|_| b"{}".to_vec());
                    Response::builder()
                        .status(StatusCode::OK)
                        .header("Content-Type", "application/json")
                        .body(Full::new(Bytes::from(body)))
                        .unwrap()
                }
                "/metrics" => {
                    let stats = service.stats();
                    queued_gauge
                        .with_label_values(&["high"])
                        .set(stats.queue.queued.high as f64);
                    queued_gauge
                        .with_label_values(&["low"])
                        .set(stats.queue.queued.low as f64);
                    in_flight_gauge.set(stats.queue.in_flight as f64);
                    tokens_gauge.set(stats.queue.rate_limiter.tokens);

                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                        tracing::error!("Failed to encode metrics: {}", e);
                    }

                    Response::builder()
                        .status(StatusCode::OK)
                        .header("Content-Type", encoder.format_type())
                        .body(Full::new(Bytes::from(buffer)))
                        .unwrap()
                }
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Full::new(Bytes::from("not found")))
                    .unwrap(),
            };
            Ok::<_, std::convert::Infallible>(response)
        }
    };

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid status server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind status server: {}", e)))?;

    info!("Status server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Status server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let handler = handler.clone();

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handler))
                .await
            {
                tracing::error!("Status server connection error: {}", e);
            }
        });
    }
}
