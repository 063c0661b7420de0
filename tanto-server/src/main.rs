//! # TantoKV Server
//!
//! Run with: `cargo run --bin tanto-server`
//!
//! All configuration comes from `TANTO_*` environment variables; see
//! `tanto_core::config` for the full surface.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, Level};

use tanto_core::config::Config;
use tanto_server::{http, rpc};
use tanto_storage::Engine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let config = Config::from_env().context("loading configuration")?;
    let http_addr = config.http_addr();
    let rpc_addr = config.rpc_addr();
    let rpc_enabled = config.rpc.enabled;

    let engine = Arc::new(Engine::new(config).context("initializing engine")?);
    engine.reload().context("reloading databases from disk")?;

    let mut rpc_task = None;
    if rpc_enabled {
        let listener = tokio::net::TcpListener::bind(&rpc_addr)
            .await
            .with_context(|| format!("binding RPC listener on {rpc_addr}"))?;
        info!("starting RPC server on {rpc_addr}");
        let rpc_engine = engine.clone();
        rpc_task = Some(tokio::spawn(async move {
            if let Err(e) = rpc::serve(listener, rpc_engine).await {
                error!("RPC server stopped: {e}");
            }
        }));
    }

    let state = http::AppState::new(engine.clone());
    let app = http::router(state);
    let listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .with_context(|| format!("binding HTTP listener on {http_addr}"))?;
    info!("starting HTTP server on {http_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("received signal, shutting down");
    if let Some(task) = rpc_task {
        task.abort();
    }

    for (name, err) in engine.close_all() {
        error!("error closing database {name}: {err}");
    }
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
