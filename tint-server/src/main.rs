mod config;
mod cors;
mod error;
mod routes;
mod scratch;
mod state;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hf_hub::api::tokio::Api;
use tint_core::{load_pipelines, ImageProcessor, ThemeTable};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Args;
use crate::scratch::ScratchSpace;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let themes = match &args.themes {
        Some(path) => ThemeTable::from_json_file(path)?,
        None => ThemeTable::default(),
    };
    info!(count = themes.len(), "loaded theme table");

    let pipelines = load_pipelines(&args.pipeline_config(), Api::new()?, args.device_map())
        .await
        .context("failed to load pipelines")?;

    let scratch = ScratchSpace::new(&args.scratch_dir);
    info!(root = %scratch.root().display(), "scratch space");
    let state = Arc::new(AppState::new(ImageProcessor::new(themes, pipelines), scratch));

    let app = routes::router(
        state,
        cors::cors_layer(args.cors_origins.as_deref()),
        args.max_upload_bytes(),
    );

    let addr = args.bind_address();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "server running");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("tint-server stopped");
    Ok(())
}

fn init_tracing(args: &Args) {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match args.log.parse::<EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: TINT_LOG='{}' is not a valid tracing filter ({e}); falling back to 'info'",
                    args.log
                );
                EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
