use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod api;
mod app_state;
mod bootstrap;
mod catalog;
mod config;
mod downloads;
mod errors;
mod install;
mod jobs;
mod preflight;
mod queue;
mod scheduler;
mod tasks;
mod util;
mod worker;

use hearth_topics as topics;

#[tokio::main]
async fn main() {
    let filter = std::env::var("HEARTH_LOG")
        .ok()
        .filter(|s| !s.is_empty())
        .and_then(|s| EnvFilter::try_new(s).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match config::Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(2);
        }
    };
    let bind = config.bind;

    let bootstrap::BootstrapOutput {
        router,
        state,
        tasks,
    } = match bootstrap::build(config).await {
        Ok(output) => output,
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(2);
        }
    };

    let listener = match tokio::net::TcpListener::bind(bind).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("error: bind {bind}: {err}");
            std::process::exit(2);
        }
    };
    info!(%bind, "hearth-server listening");
    state.bus().publish(
        topics::TOPIC_SERVICE_START,
        &serde_json::json!({"version": env!("CARGO_PKG_VERSION")}),
    );

    if let Err(err) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(%err, "server exited with error");
    }

    state
        .bus()
        .publish(topics::TOPIC_SERVICE_STOP, &serde_json::json!({}));
    tasks.shutdown_with_grace(Duration::from_secs(3)).await;
    info!("shutdown complete");
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to listen for shutdown signal");
    }
}
