//! # tcm-agent
//!
//! Control loop and daemon (tcmd) for the timeseries cardinality manager.
//!
//! This crate wires the engine to its collaborators: a Prometheus HTTP
//! backend, a configuration store, Prometheus instrumentation and a tick
//! source. [`Controller`] runs one pass per tick and can be reloaded with a
//! new configuration snapshot at any time.

pub mod backend;
pub mod config;
pub mod controller;
pub mod ticker;

pub use backend::PrometheusBackend;
pub use crate::config::{AgentConfig, BackendConfig, LoggingConfig, StoreConfig, StoreKind};
pub use controller::{Controller, ControllerState, JobFailure, PassReport, Snapshot};
pub use ticker::{IntervalTicker, ManualTicker, ManualTickerHandle};

use std::sync::Arc;
use tcm_core::ConfigStore;
use tcm_engine::{InMemoryConfigStore, RelabelFileStore};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Core error: {0}")]
    Core(#[from] tcm_core::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] tcm_engine::EngineError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] tcm_metrics::MetricsError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// Initialize logging and tracing
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(logging_config: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging_config.level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(logging_config.show_target)
        .with_thread_ids(logging_config.show_thread_ids)
        .with_line_number(logging_config.show_line_numbers);

    let result = match logging_config.format.as_str() {
        "json" => subscriber.json().try_init(),
        _ => subscriber.try_init(),
    };

    result.map_err(|e| AgentError::Config(format!("Failed to initialize logging: {}", e)))
}

/// Build the configuration store selected by `config`
pub fn build_store(config: &StoreConfig) -> Arc<dyn ConfigStore> {
    match config.kind {
        StoreKind::Memory => Arc::new(InMemoryConfigStore::new()),
        StoreKind::File => Arc::new(RelabelFileStore::new(config.path.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_config_creation() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store.kind, StoreKind::File);
    }

    #[tokio::test]
    async fn test_build_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            kind: StoreKind::File,
            path: dir.path().to_path_buf(),
        };

        let store = build_store(&config);
        let drops = ["m1".to_string()].into_iter().collect();
        store.write_drop_list("api", &drops).await.unwrap();
        assert!(dir.path().join("scrape/api.yaml").exists());

        let memory = build_store(&StoreConfig {
            kind: StoreKind::Memory,
            ..config
        });
        assert!(memory.read_drop_list("api").await.unwrap().is_empty());
    }
}
