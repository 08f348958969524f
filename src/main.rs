//! libvirt-exporter entry point.
//!
//! Parses the command line, wires the exporter to the configured
//! virtualization URI, and serves the metrics endpoint until SIGINT or
//! SIGTERM.

use std::sync::Arc;

use anyhow::Context;
use axum::{routing::get, Router};
use clap::Parser;
use tokio::{net::TcpListener, signal};
use tracing::{error, info, Level};

use libvirt_exporter::cli::{Args, LogLevel};
use libvirt_exporter::collector::Exporter;
use libvirt_exporter::exposition::{metrics_handler, root_handler, AppState};
use libvirt_exporter::hypervisor::Connector;

/// Initializes tracing logging subsystem with configured log level.
fn setup_logging(args: &Args) {
    let log_level = match args.log_level {
        LogLevel::Off => Level::ERROR,
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(true)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Failed to set tracing subscriber");
    }
}

#[cfg(feature = "libvirt")]
fn connector() -> Box<dyn Connector + Send + Sync> {
    Box::new(libvirt_exporter::hypervisor::libvirt::LibvirtConnector)
}

#[cfg(not(feature = "libvirt"))]
fn connector() -> Box<dyn Connector + Send + Sync> {
    Box::new(libvirt_exporter::hypervisor::UnavailableConnector)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging(&args);

    info!(
        uri = %args.libvirt_uri,
        listen = %args.listen_address,
        "Starting libvirt-exporter"
    );

    let exporter = Arc::new(Exporter::new(
        connector(),
        args.libvirt_uri.clone(),
        args.procfs_path.clone(),
    ));
    let state = AppState::new(exporter).context("failed to set up metrics registry")?;

    let mut app = Router::new().route(&args.telemetry_path, get(metrics_handler));
    if args.telemetry_path != "/" {
        app = app.route("/", get(root_handler));
    }
    let app = app.with_state(state);

    let shutdown_signal = async {
        let ctrl_c = async {
            if signal::ctrl_c().await.is_err() {
                error!("Failed to install Ctrl+C handler");
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => error!("Failed to install SIGTERM handler: {}", e),
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), shutting down gracefully...");
            }
            _ = terminate => {
                info!("Received SIGTERM, shutting down gracefully...");
            }
        }
    };

    let listener = TcpListener::bind(args.listen_address)
        .await
        .with_context(|| format!("failed to bind {}", args.listen_address))?;
    info!("libvirt-exporter listening on http://{}", args.listen_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("server error")?;

    info!("libvirt-exporter stopped gracefully");
    Ok(())
}
