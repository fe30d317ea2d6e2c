use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

use hls_vault::commands::router;
use hls_vault::utils::logging::{init_tracing, local_logging_enabled, resolve_log_dir, LOG_FILE_NAME};
use hls_vault::{AppConfig, AppState, NAME, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load().context("Failed to load configuration")?;
    init_tracing(Some(&config.advanced.tracing_filter()));
    info!("Starting {} v{}", NAME, VERSION);
    if local_logging_enabled() {
        if let Ok(dir) = resolve_log_dir() {
            info!("Writing logs to {:?}", dir.join(LOG_FILE_NAME));
        }
    }

    let addr = config.bind_addr()?;
    let state = AppState::from_config(config).await?;

    let encoder = state.encoder.probe().await;
    if encoder.available {
        info!(
            "Encoder: {}",
            encoder.version.as_deref().unwrap_or(&encoder.program)
        );
    } else {
        error!(
            "Encoder {} is not usable ({}); download jobs will fail until it is installed",
            encoder.program,
            encoder.error.as_deref().unwrap_or("unknown error")
        );
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!("Listening on http://{}", addr);

    let manager = state.manager.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running HTTP server")?;

    info!("Cancelling {} running jobs", manager.active_count());
    manager.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        // Without a handler there is no signal to wait for; keep serving
        error!("Failed to install Ctrl+C handler: {}", err);
        std::future::pending::<()>().await;
    }
}
