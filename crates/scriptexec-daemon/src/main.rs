//! scriptexec-daemon - script executor hosting daemon.
//!
//! Wires the execution pipeline to the in-cluster API, installs the audit
//! sink, and serves the approval/health/metrics HTTP surface. The
//! step-execution RPC listener is mounted by the transport deployment in
//! front of [`ExecutorService`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use scriptexec_core::audit::{AuditSink, JsonlSink, NullSink};
use scriptexec_core::cluster::HttpCluster;
use scriptexec_core::config::ExecutorConfig;
use scriptexec_core::execution::Manager;
use scriptexec_daemon::api::{self, AppState};
use scriptexec_daemon::metrics::MetricsRegistry;
use scriptexec_daemon::service::ExecutorService;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Script executor daemon.
#[derive(Parser, Debug)]
#[command(name = "scriptexec-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the executor configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter when RUST_LOG is not set (e.g. `info`,
    /// `scriptexec_core=debug`).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    let config = ExecutorConfig::load(args.config.as_deref()).context("load configuration")?;
    info!(
        namespace = %config.cluster.namespace,
        http_port = config.server.http_port,
        "starting script executor"
    );

    let cluster = Arc::new(HttpCluster::in_cluster().context("build cluster client")?);

    let (audit_sink, audit_failures): (Arc<dyn AuditSink>, Arc<dyn Fn() -> u64 + Send + Sync>) =
        if config.audit.enabled {
            let sink = Arc::new(
                JsonlSink::open(&config.audit.log_file)
                    .await
                    .context("open audit log")?,
            );
            let failures = Arc::clone(&sink);
            (sink, Arc::new(move || failures.write_failures()))
        } else {
            (Arc::new(NullSink), Arc::new(|| 0))
        };

    let manager = Arc::new(Manager::new(config.clone(), cluster).with_audit_sink(audit_sink));
    let registry = Arc::new(MetricsRegistry::try_new().context("register metrics")?);
    let failures = Arc::clone(&audit_failures);
    let service = Arc::new(
        ExecutorService::new(Arc::clone(&manager), registry.executor_metrics())
            .with_audit_failures(move || failures()),
    );

    let state = AppState {
        checker: manager.approval_checker(),
        service,
        registry,
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.http_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind HTTP listener on {addr}"))?;
    info!(%addr, "approval HTTP surface listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("shutdown complete");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received interrupt"),
        () = terminate => info!("received SIGTERM"),
    }
}
