//! svc-gateway: gRPC + REST front door with authentication and admission control.

use std::net::SocketAddr;

use svc_gateway::config::Config;
use svc_gateway::startup::{App, build_app};
use svc_telemetry::{init_metrics, setup_telemetry};
use tokio::signal;
use tracing::info;

/// Build version (injected at compile time or default)
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::init()?;
    let telemetry = setup_telemetry(&config.telemetry_config());
    let metrics_handle = init_metrics();

    info!(
        version = VERSION,
        address = %config.address,
        otlp = config.otlp_endpoint.is_some(),
        pid = std::process::id(),
        "Starting svc-gateway"
    );

    let App {
        router,
        addr,
        admission,
        retry,
    } = build_app(&config, Some(metrics_handle)).await?;

    info!(
        address = %addr,
        retry_max_attempts = retry.config().max_attempts(),
        "Server listening"
    );

    // Run server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    admission.shutdown();
    telemetry.shutdown();
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}
