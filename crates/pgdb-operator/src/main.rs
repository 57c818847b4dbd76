//! PostgreSQL Database Operator
//!
//! This operator manages Database custom resources in Kubernetes, creating
//! and dropping roles and databases on a target PostgreSQL server.

use anyhow::{Context, Result};
use clap::Parser;
use kube::{Api, Client};
use pgdb_operator::cache::KubeResourceCache;
use pgdb_operator::controller::{Controller, ControllerConfig, DEFAULT_THREADINESS};
use pgdb_operator::crd::{self, Database};
use pgdb_operator::events::KubeEventSink;
use pgdb_operator::postgres::{PgExecutor, DEFAULT_POOL_SIZE};
use pgdb_operator::rate_limiter::{
    RateLimitConfig, DEFAULT_BASE_DELAY, DEFAULT_BURST, DEFAULT_MAX_DELAY, DEFAULT_QPS,
};
use pgdb_operator::reconciler::ErrorStatePolicy;
use pgdb_operator::status::KubeStatusWriter;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// PostgreSQL Database Operator
#[derive(Parser, Debug)]
#[command(name = "pgdb-operator")]
#[command(about = "Kubernetes operator that provisions PostgreSQL roles and databases")]
#[command(version)]
struct Args {
    /// Connection URL of the target PostgreSQL server
    #[arg(long, env = "POSTGRES_URL", required_unless_present = "print_crd")]
    postgres_url: Option<String>,

    /// Maximum number of pooled PostgreSQL connections
    #[arg(long, env = "POOL_SIZE", default_value_t = DEFAULT_POOL_SIZE)]
    pool_size: usize,

    /// Number of concurrent reconciliation workers
    #[arg(long, env = "THREADINESS", default_value_t = DEFAULT_THREADINESS)]
    threadiness: usize,

    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// What to do with databases in error state (hold, retry)
    #[arg(long, env = "ERROR_POLICY", default_value = "hold")]
    error_policy: ErrorStatePolicy,

    /// Initial retry delay after a failed reconciliation, in milliseconds
    #[arg(long, default_value_t = DEFAULT_BASE_DELAY.as_millis() as u64)]
    backoff_base_ms: u64,

    /// Maximum retry delay after repeated failures, in seconds
    #[arg(long, default_value_t = DEFAULT_MAX_DELAY.as_secs())]
    backoff_max_secs: u64,

    /// Overall requeue rate limit
    #[arg(long, default_value_t = DEFAULT_QPS)]
    qps: f64,

    /// Overall requeue burst
    #[arg(long, default_value_t = DEFAULT_BURST)]
    burst: u32,

    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Health probe address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,
}

impl Args {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            threadiness: self.threadiness,
            error_policy: self.error_policy,
            rate_limit: RateLimitConfig {
                base_delay: Duration::from_millis(self.backoff_base_ms),
                max_delay: Duration::from_secs(self.backoff_max_secs),
                qps: self.qps,
                burst: self.burst,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle CRD printing
    if args.print_crd {
        print_crd()?;
        return Ok(());
    }

    // Initialize logging
    init_logging(&args)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = if args.namespace.is_empty() {
            "all"
        } else {
            &args.namespace
        },
        threadiness = args.threadiness,
        error_policy = %args.error_policy,
        "Starting PostgreSQL Database Operator"
    );

    // Initialize metrics before any handles are registered
    start_metrics_server(args.metrics_addr)?;

    // The target server must be reachable before anything is reconciled
    let postgres_url = args
        .postgres_url
        .as_deref()
        .context("--postgres-url is required")?;
    let executor = PgExecutor::connect(postgres_url, args.pool_size)
        .context("Failed to create PostgreSQL pool")?;
    executor
        .ping()
        .await
        .context("Failed to connect to PostgreSQL")?;
    info!("Connected to PostgreSQL");

    // Create Kubernetes client
    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let databases: Api<Database> = if args.namespace.is_empty() {
        Api::all(client.clone())
    } else {
        Api::namespaced(client.clone(), &args.namespace)
    };

    let (cache, notifications, watch) = KubeResourceCache::start(databases);
    let config = args.controller_config();
    let controller = Controller::new(
        Arc::new(cache),
        Arc::new(executor),
        Arc::new(KubeStatusWriter::new(client.clone())),
        Arc::new(KubeEventSink::new(client)),
        &config,
    );

    // Start health server
    let health_addr = args.health_addr;
    let ready = controller.ready_flag();
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr, ready).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    // Run the controller
    let result = controller
        .run(config.threadiness, notifications, shutdown_signal())
        .await;
    watch.abort();
    result.context("Controller failed")?;

    info!("Operator stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Install the tracing subscriber
///
/// `RUST_LOG` takes precedence over `--log-level` so single modules can be
/// turned up without raising the global level.
fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Start the Prometheus metrics server
///
/// Installs the global recorder; the listener runs on the current runtime.
fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    Ok(())
}

/// Serve the kubelet probes
///
/// `/healthz` answers as long as the process runs. `/readyz` (and any other
/// path) answers 503 until the cache has synced and the workers are running.
async fn start_health_server(addr: SocketAddr, ready: Arc<AtomicBool>) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    info!(address = %addr, "Starting health server");

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;

    loop {
        let (mut socket, _) = listener.accept().await?;
        let ready = ready.clone();

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            let Ok(n) = socket.read(&mut buf).await else {
                return;
            };
            let request = String::from_utf8_lossy(&buf[..n]);
            let path = request.split_whitespace().nth(1).unwrap_or("/");

            let response = health_response(path, ready.load(Ordering::SeqCst));
            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}

fn health_response(path: &str, ready: bool) -> &'static str {
    match (path, ready) {
        ("/healthz", _) | (_, true) => "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK",
        _ => "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 9\r\n\r\nNOT READY",
    }
}

/// Print the Database CRD, without a status subresource
fn print_crd() -> Result<()> {
    let yaml = serde_yaml::to_string(&crd::crd_definition())?;
    println!("{}", yaml);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_responses() {
        assert!(health_response("/healthz", false).starts_with("HTTP/1.1 200"));
        assert!(health_response("/readyz", false).starts_with("HTTP/1.1 503"));
        assert!(health_response("/readyz", true).starts_with("HTTP/1.1 200"));
    }

    #[test]
    fn test_args_build_controller_config() {
        let args = Args::parse_from([
            "pgdb-operator",
            "--postgres-url",
            "postgres://localhost/postgres",
            "--error-policy",
            "retry",
            "--threadiness",
            "4",
        ]);
        let config = args.controller_config();

        assert_eq!(config.threadiness, 4);
        assert_eq!(config.error_policy, ErrorStatePolicy::Retry);
        assert_eq!(config.rate_limit.base_delay, DEFAULT_BASE_DELAY);
        assert_eq!(config.rate_limit.max_delay, DEFAULT_MAX_DELAY);
    }

    #[test]
    fn test_print_crd_does_not_need_postgres_url() {
        let args = Args::parse_from(["pgdb-operator", "--print-crd"]);
        assert!(args.print_crd);
    }
}
