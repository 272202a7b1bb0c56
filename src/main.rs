//! tiercached - Multi-Tier Cache Daemon
//!
//! Hosts a [`CacheManager`] built from a YAML settings file and CLI flags,
//! runs its maintenance loop, and serves its statistics.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          tiercached                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │ Maintenance  │───▶│ CacheManager │◀───│   Metrics /  │       │
//! │  │ warm + sweep │    │ local/durable│    │   Health     │       │
//! │  │              │    │   /shared    │    │   servers    │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::cache::{system_clock, Maintenance, MaintenanceConfig};
use tiercache::monitoring::{CacheExporter, TierHealth};
use tiercache::{CacheManager, CacheSettings, Error, Result, WarmingScheduler};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tiercached - group-policy multi-tier cache daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML settings file
    #[arg(long, env = "TIERCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory of the durable tier (overrides the settings file)
    #[arg(long, env = "TIERCACHE_DURABLE_DIR")]
    durable_dir: Option<PathBuf>,

    /// Local memory budget in bytes
    #[arg(long, env = "TIERCACHE_MEMORY_BUDGET")]
    memory_budget: Option<u64>,

    /// Durable/shared call timeout (e.g. "100ms")
    #[arg(long, env = "TIERCACHE_TIER_TIMEOUT")]
    tier_timeout: Option<String>,

    /// Enable the in-process shared tier
    #[arg(long, env = "TIERCACHE_SHARED_TIER")]
    shared_tier: bool,

    /// Warming interval (e.g. "1h")
    #[arg(long, env = "TIERCACHE_WARM_INTERVAL")]
    warm_interval: Option<String>,

    /// Expiry sweep interval (e.g. "24h")
    #[arg(long, env = "TIERCACHE_SWEEP_INTERVAL")]
    sweep_interval: Option<String>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

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
    /// Settings file contents with CLI overrides applied
    fn settings(&self) -> Result<CacheSettings> {
        let mut settings = match &self.config {
            Some(path) => CacheSettings::load(path)?,
            None => CacheSettings::default(),
        };

        if let Some(dir) = &self.durable_dir {
            settings.durable_dir = Some(dir.clone());
        }
        if let Some(budget) = self.memory_budget {
            settings.memory_budget_bytes = Some(budget);
        }
        if let Some(timeout) = &self.tier_timeout {
            settings.tier_timeout = Some(timeout.clone());
        }
        if self.shared_tier {
            settings.shared_tier = Some(true);
        }
        if let Some(interval) = &self.warm_interval {
            settings.warm_interval = Some(interval.clone());
        }
        if let Some(interval) = &self.sweep_interval {
            settings.sweep_interval = Some(interval.clone());
        }
        Ok(settings)
    }
}

/// State shared by the HTTP handlers
struct AppState {
    cache: Arc<CacheManager>,
    exporter: CacheExporter,
    health: TierHealth,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting tiercached");

    let settings = args.settings()?;
    let maintenance_config = MaintenanceConfig {
        warm_interval: settings.warm_interval()?,
        sweep_interval: settings.sweep_interval()?,
    };
    info!("  Memory budget: {} bytes", settings.memory_budget());
    info!("  Tier timeout: {:?}", settings.tier_timeout()?);
    info!("  Warm interval: {:?}", maintenance_config.warm_interval);
    info!("  Sweep interval: {:?}", maintenance_config.sweep_interval);

    let cache = Arc::new(CacheManager::from_settings(&settings, system_clock()).await?);
    info!("Cache groups: {}", cache.registry().names().join(", "));

    let warming = Arc::new(WarmingScheduler::new(cache.clone()));
    let maintenance = Arc::new(Maintenance::new(
        cache.clone(),
        warming,
        maintenance_config,
    ));
    let shutdown = maintenance.shutdown_token();
    let maintenance_handle = tokio::spawn(maintenance.run());

    let state = Arc::new(AppState {
        cache: cache.clone(),
        exporter: CacheExporter::new()?,
        health: TierHealth::new(cache),
    });

    // Start health server
    let health_state = state.clone();
    let health_shutdown = shutdown.clone();
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = serve(&health_addr, "Health", health_state, health_shutdown).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_shutdown = shutdown.clone();
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = serve(&metrics_addr, "Metrics", state, metrics_shutdown).await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    shutdown.cancel();

    maintenance_handle
        .await
        .map_err(|e| Error::Internal(format!("Maintenance task failed: {}", e)))?;

    info!("tiercached shutdown complete");
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

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "h2=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

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
// HTTP Servers
// =============================================================================

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => respond(status, "application/json", body),
        Err(e) => respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain",
            format!("serialization error: {}", e),
        ),
    }
}

async fn handle(
    state: Arc<AppState>,
    req: Request<hyper::body::Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/healthz" | "/livez" => respond(StatusCode::OK, "text/plain", "ok"),
        "/readyz" => {
            let report = state.health.check().await;
            let status = if report.status.is_operational() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json_response(status, &report)
        }
        "/stats" => json_response(StatusCode::OK, &state.cache.stats()),
        "/metrics" => {
            state.exporter.refresh(&state.cache.stats());
            match state.exporter.render() {
                Ok(text) => respond(StatusCode::OK, "text/plain; version=0.0.4", text),
                Err(e) => respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    e.to_string(),
                ),
            }
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
    };
    Ok(response)
}

async fn serve(
    addr: &str,
    name: &'static str,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid {} server address: {}", name, e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind {} server: {}", name, e)))?;

    info!("{} server listening on {}", name, addr);

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("{} server stopping", name);
                return Ok(());
            }
            accepted = listener.accept() => accepted
                .map_err(|e| Error::Internal(format!("{} server accept error: {}", name, e)))?,
        };

        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle(state.clone(), req));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("{} server connection error: {}", name, e);
            }
        });
    }
}
