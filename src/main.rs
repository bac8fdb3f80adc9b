//! Storage Provisioner
//!
//! Runs one storage provisioner worker against an in-process controller.
//! Desired state is read from a YAML manifest of changes; health and
//! Prometheus metrics are served over HTTP.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_provisioner::{
    load_manifest, InMemoryController, ManagedFilesystemSource, ModelKind, ProvisionerConfig,
    ProvisionerContext, RestartBackoff, SourceRegistry, Worker, WorkerConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Storage Provisioner - reconciles filesystems and their attachments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Worker configuration file (YAML)
    #[arg(long, env = "PROVISIONER_CONFIG")]
    config: Option<PathBuf>,

    /// Base storage directory, overrides the configuration file
    #[arg(long, env = "STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Desired-state manifest (YAML list of changes)
    #[arg(long, env = "PROVISIONER_MANIFEST")]
    manifest: Option<PathBuf>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args)?;

    let mut config = match &args.config {
        Some(path) => WorkerConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => WorkerConfig::default(),
    };
    if let Some(storage_dir) = &args.storage_dir {
        config.storage_dir = storage_dir.clone();
        config.validate()?;
    }

    info!("Starting Storage Provisioner");
    info!("  Version: {}", storage_provisioner::VERSION);
    info!("  Storage dir: {}", config.storage_dir.display());
    info!("  Model kind: {}", config.model_kind);
    info!("  Error classification: {:?}", config.retry.classification);
    info!(
        "  Tolerate missing detach source: {}",
        config.tolerates_missing_detach_source()
    );

    let providers = SourceRegistry::with_defaults(config.tmpfs_capacity_mib);
    info!("Storage providers: {}", providers.providers().join(", "));
    let mut ctx = ProvisionerContext::new(
        ProvisionerConfig::from(&config),
        Arc::new(providers),
        Arc::new(InMemoryController::new()),
    )
    .with_classifier(config.retry.classifier());
    // Container models have no volumes to layer filesystems on.
    if config.model_kind == ModelKind::Iaas {
        ctx = ctx.with_managed_source(Arc::new(ManagedFilesystemSource::new(&config.storage_dir)));
    }

    let (mut worker, handle) = Worker::new(ctx, config.drain_interval());
    if let Some(path) = &args.manifest {
        let changes = load_manifest(path)
            .with_context(|| format!("loading manifest from {}", path.display()))?;
        info!("Queued {} desired-state changes from {}", changes.len(), path.display());
        for change in changes {
            handle.send(change)?;
        }
    }

    let ready = Arc::new(AtomicBool::new(false));

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready).await {
            error!("Health server error: {:#}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let registry = worker.metrics().registry().clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, registry).await {
            error!("Metrics server error: {:#}", e);
        }
    });

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        shutdown.cancel();
    });

    ready.store(true, Ordering::SeqCst);
    supervise(&mut worker, cancel).await;

    info!("Storage provisioner shutdown complete");
    Ok(())
}

/// Run the worker, restarting it with exponential backoff when a pass fails
async fn supervise(worker: &mut Worker, cancel: CancellationToken) {
    let mut restart = RestartBackoff::new(Duration::from_secs(1), Duration::from_secs(60));

    loop {
        let started = Instant::now();
        match worker.run(cancel.clone()).await {
            Ok(()) => return,
            Err(err) => {
                let delay = restart.after_failure(started.elapsed());
                warn!("Storage provisioner failed: {}; restarting in {:?}", err, delay);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
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
        .add_directive("hyper=warn".parse()?);

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
    Ok(())
}

// =============================================================================
// HTTP Servers
// =============================================================================

fn respond(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                        "/readyz" if ready => respond(StatusCode::OK, "ok"),
                        "/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, "starting"),
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid health server address {:?}", addr))?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}

async fn run_metrics_server(addr: &str, registry: prometheus::Registry) -> anyhow::Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            let encoder = TextEncoder::new();
                            let mut buffer = Vec::new();
                            match encoder.encode(&registry.gather(), &mut buffer) {
                                Ok(()) => {
                                    let mut response = respond(StatusCode::OK, buffer);
                                    if let Ok(value) = encoder.format_type().parse::<hyper::header::HeaderValue>() {
                                        response
                                            .headers_mut()
                                            .insert(hyper::header::CONTENT_TYPE, value);
                                    }
                                    response
                                }
                                Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                            }
                        }
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics server address {:?}", addr))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}
