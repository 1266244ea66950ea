//! Optional diagnostic HTTP endpoint.
//!
//! Best effort: failing to bind or serve is logged and never takes the
//! tunnel down.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::io;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::stats::{StatsSnapshot, TunnelStats};

#[derive(Serialize)]
struct VersionInfo {
    version: &'static str,
}

pub fn router(stats: Arc<TunnelStats>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/version", get(version))
        .route("/stats", get(get_stats))
        .with_state(stats)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn version() -> Json<VersionInfo> {
    Json(VersionInfo {
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn get_stats(State(stats): State<Arc<TunnelStats>>) -> Json<StatsSnapshot> {
    Json(stats.snapshot())
}

/// Serve the diagnostic endpoint on an already bound listener.
pub async fn serve(listener: TcpListener, stats: Arc<TunnelStats>) -> io::Result<()> {
    axum::serve(listener, router(stats)).await
}

/// Bind `addr` and serve in the background.
pub fn spawn(addr: String, stats: Arc<TunnelStats>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr = %addr, error = %e, "Failed to bind diagnostic endpoint");
                return;
            }
        };
        info!("Starting diagnostic endpoint at http://{addr}");

        if let Err(e) = serve(listener, stats).await {
            error!(error = %e, "Diagnostic endpoint failed");
        }
    })
}
