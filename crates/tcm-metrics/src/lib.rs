//! # tcm-metrics
//!
//! Prometheus instrumentation for the timeseries cardinality manager.
//!
//! This crate provides:
//! - The metric families describing drops, budgets, failures and passes
//! - A Prometheus exporter serving `/metrics` and `/health`
//! - A registry implementing [`tcm_core::InstrumentationSink`], which also
//!   logs every control event under the `tcm::events` target

pub mod common;
pub mod prometheus_metrics;
pub mod registry;

pub use common::CardinalityMetrics;
pub use prometheus_metrics::PrometheusExporter;
pub use registry::{MetricsRegistry, MetricsRegistryBuilder};

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Metric families could not be built or registered
    #[error("Metric registration failed: {0}")]
    Registry(String),

    #[error("Exposition failed: {0}")]
    Export(String),

    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),

    #[error("Exporter I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid metrics settings: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, MetricsError>;

/// Instrumentation settings, the `metrics` section of the agent config
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve the Prometheus endpoint
    pub prometheus_enabled: bool,

    /// Address serving `/metrics` and `/health`
    pub prometheus_bind_addr: SocketAddr,

    /// Constant labels added to every metric
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prometheus_enabled: true,
            prometheus_bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 9465)),
            global_labels: HashMap::new(),
        }
    }
}

/// Build the registry described by `config`
///
/// The exporter is configured but not started; call
/// [`MetricsRegistry::start_exporters`] once the runtime is up.
pub fn init_metrics(config: MetricsConfig) -> Result<MetricsRegistry> {
    let mut builder = MetricsRegistryBuilder::new().with_global_labels(config.global_labels);

    if config.prometheus_enabled {
        builder = builder.with_prometheus_endpoint(config.prometheus_bind_addr);
    }

    builder.build()
}
