use std::net::SocketAddr;

use anyhow::Context;
use qwenproxy_core::{AppConfig, AppState};

mod handlers;
mod logging;
mod middleware;
mod router;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("invalid configuration")?;
    logging::init(&config.log_level, &config.log_format);

    let shutdown_timeout = config.shutdown_timeout();
    let bind = format!("{}:{}", config.server_host, config.server_port);

    let state = AppState::build(config)?;
    state.spawn_background_tasks();

    let app = router::build(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(%bind, "qwenproxy listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_timeout))
    .await
    .context("server error")?;

    Ok(())
}

async fn shutdown_signal(timeout: std::time::Duration) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!(?timeout, "shutdown signal received, draining in-flight requests");
}
