//! Worker-side HTTP proxy
//!
//! One worker owns one axum server on the shared listener. Every request
//! that is not the health endpoint flows through the pipeline: route match,
//! upstream selection, layered mutation, forward, response shaping. SSE
//! responses are piped through the stream transformer chunk by chunk so
//! other in-flight requests are never blocked.

mod error;
mod pipeline;
mod sse;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    routing::{any, get},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::health::{probe, HealthRegistry};

use pipeline::proxy_handler;

/// Shared state for one worker's request handlers.
#[derive(Clone)]
pub struct ProxyState {
    /// HTTP client for forwarding; redirects are surfaced to the client
    /// rather than followed.
    pub(crate) client: reqwest::Client,
    /// The config document this worker was started with. Never hot-swapped;
    /// reloads replace the whole worker.
    pub(crate) config: Arc<Config>,
    /// Runtime upstream health for failover-enabled routes.
    pub(crate) registry: Arc<HealthRegistry>,
    /// Channel into the recovery probe worker.
    pub(crate) probe: probe::ProbeHandle,
    /// Maximum accepted request body size in bytes.
    pub(crate) body_limit: usize,
}

/// Run the worker server until `shutdown` resolves, then drain and return.
pub async fn start_worker(
    config: Config,
    body_limit: usize,
    listener: TcpListener,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    // No overall request timeout: SSE responses are long-lived by design.
    // Dead upstreams are caught by the connect timeout and handed to
    // failover.
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(10)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("Failed to create HTTP client")?;

    let registry = Arc::new(HealthRegistry::initialize(&config));
    let probe = probe::spawn(registry.clone());

    let state = ProxyState {
        client,
        config: Arc::new(config),
        registry,
        probe,
        body_limit,
    };

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/*path", any(proxy_handler))
        .with_state(state);

    let addr = listener.local_addr().context("listener has no address")?;
    tracing::info!("worker listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    tracing::info!("worker shut down gracefully");
    Ok(())
}

/// Liveness endpoint; never routed to upstreams.
async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
