//! Read-only report endpoint.
//!
//! Every request, whatever its method or path, gets `200 OK` with the current
//! [`Report`] as JSON. Request bodies are ignored.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{extract::State, Json, Router};
use tokio::net::TcpListener;
use tracing::info;

use crate::report::Report;
use crate::store::MetricsStore;

pub fn router(store: Arc<MetricsStore>) -> Router {
    Router::new().fallback(report).with_state(store)
}

async fn report(State(store): State<Arc<MetricsStore>>) -> Json<Report> {
    Json(store.snapshot())
}

pub async fn bind(addr: &str) -> anyhow::Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid bind address: {addr}"))?;
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind report endpoint on {addr}"))
}

/// Serve reports on `listener` until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    store: Arc<MetricsStore>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("Serving reports on http://{}", listener.local_addr()?);
    axum::serve(listener, router(store))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Report endpoint failed")
}
