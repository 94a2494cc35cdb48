//! HTTP endpoint serving `/metrics` and `/health`

use crate::{MetricsError, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Serves a registry over HTTP for scraping
#[derive(Debug)]
pub struct PrometheusExporter {
    registry: Arc<Registry>,
    healthy: Arc<AtomicBool>,
    bind_addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    server_handle: Option<tokio::task::JoinHandle<()>>,
}

impl PrometheusExporter {
    /// Create an exporter serving `registry`
    ///
    /// `/health` answers 503 while `healthy` is false.
    pub fn new(registry: Arc<Registry>, healthy: Arc<AtomicBool>, bind_addr: SocketAddr) -> Self {
        Self {
            registry,
            healthy,
            bind_addr,
            local_addr: None,
            server_handle: None,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Bind and serve in a background task
    pub async fn start_server(&mut self) -> Result<()> {
        if self.server_handle.is_some() {
            return Err(MetricsError::Config(format!(
                "Exporter already serving on {}",
                self.metrics_url()
            )));
        }

        let state = ExporterState {
            registry: self.registry.clone(),
            healthy: self.healthy.clone(),
        };
        let listener = TcpListener::bind(self.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(addr = %local_addr, "Serving metrics");

        let server_handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router(state)).await {
                warn!(error = %e, "Metrics endpoint stopped");
            }
        });

        self.local_addr = Some(local_addr);
        self.server_handle = Some(server_handle);
        Ok(())
    }

    pub async fn stop_server(&mut self) {
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.local_addr = None;
    }

    /// Current metrics in text exposition format
    pub fn export_metrics(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Address actually bound, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn metrics_url(&self) -> String {
        format!("http://{}/metrics", self.local_addr.unwrap_or(self.bind_addr))
    }

    pub fn is_running(&self) -> bool {
        self.server_handle.is_some()
    }
}

impl Drop for PrometheusExporter {
    fn drop(&mut self) {
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
        }
    }
}

/// Encode everything in `registry` as Prometheus text
pub(crate) fn encode(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut text = Vec::new();
    encoder
        .encode(&metric_families, &mut text)
        .map_err(|e| MetricsError::Export(format!("encoding {} families: {}", metric_families.len(), e)))?;

    String::from_utf8(text).map_err(|e| MetricsError::Export(format!("non UTF-8 exposition: {}", e)))
}

#[derive(Clone)]
struct ExporterState {
    registry: Arc<Registry>,
    healthy: Arc<AtomicBool>,
}

fn router(state: ExporterState) -> Router {
    Router::new()
        .route("/metrics", get(serve_metrics))
        .route("/health", get(serve_health))
        .with_state(state)
}

async fn serve_metrics(State(state): State<ExporterState>) -> Response {
    match encode(&state.registry) {
        Ok(text) => (
            StatusCode::OK,
            [("content-type", TextEncoder::new().format_type().to_string())],
            text,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Metrics scrape failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn serve_health(State(state): State<ExporterState>) -> Response {
    if state.healthy.load(Ordering::Relaxed) {
        (StatusCode::OK, "OK").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "UNHEALTHY").into_response()
    }
}
