//! peoplespot-server binary.

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use peoplespot_core::detection::{YoloDetector, YoloParams};
use peoplespot_core::runtime::configure_ort_dylib;
use peoplespot_server::{AppState, ServerConfig, create_router};

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = ServerConfig::from_env();
    info!(
        host = %config.host,
        port = config.port,
        model = %config.model.display(),
        output_dir = %config.output_dir.display(),
        streaming = config.streaming,
        "starting peoplespot-server"
    );

    // Must run while the process is still single-threaded.
    if let Some(dylib) = configure_ort_dylib() {
        info!(path = %dylib.display(), "using ONNX Runtime library");
    }
    let detector = YoloDetector::load(&config.model, YoloParams::default())
        .with_context(|| format!("failed to load model: {}", config.model.display()))?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(serve(config, detector))
}

async fn serve(config: ServerConfig, detector: YoloDetector) -> Result<()> {
    let addr = config.bind_addr()?;
    let state = AppState::new(config, detector)?;
    let session = state.session.clone();
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    let removed = session.files().clean();
    info!(removed, "server shutdown complete");
    Ok(())
}

/// Colored output by default, JSON lines with `LOG_FORMAT=json`.
fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(env_filter)
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("received shutdown signal");
}
