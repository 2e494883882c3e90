mod archive;
mod config;
mod error;
mod guard;
mod image_toolkit;
mod jobs;
mod routes;
mod state;
mod token;
mod ws;

use std::sync::Arc;

use tokio::signal;

use crate::config::AppConfig;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .init();

    tracing::info!(root = %config.storage_root.display(), "starting storage service");

    if which_archiver(&config.archiver_bin).is_none() {
        anyhow::bail!(
            "archiver binary '{}' not found on PATH; the archive toolkit (C3) cannot start without it",
            config.archiver_bin
        );
    }

    if config.transfer_jwt_secret.is_none() {
        tracing::warn!(
            "TRANSFER_JWT_SECRET is unset: transfer endpoints will reject every token and callbacks will be skipped"
        );
    }

    std::fs::create_dir_all(config.temp_dir())?;
    for type_name in &config.allowed_types {
        std::fs::create_dir_all(config.type_root(type_name))?;
    }

    let state = Arc::new(AppState::new(config.clone()));

    let app = routes::create_router(state.clone());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("storage service stopped; any in-flight jobs were abandoned (non-goal: durable job queue)");

    Ok(())
}

/// Resolve the configured archiver binary against `PATH` the way a shell would,
/// so a missing `7z` fails fast at startup rather than on the first repack.
fn which_archiver(bin: &str) -> Option<std::path::PathBuf> {
    if bin.contains(std::path::MAIN_SEPARATOR) {
        let path = std::path::PathBuf::from(bin);
        return path.is_file().then_some(path);
    }

    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(bin))
            .find(|candidate| candidate.is_file())
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
