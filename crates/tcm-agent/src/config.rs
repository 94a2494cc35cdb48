//! Configuration management for the cardinality agent

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tcm_core::Config as CoreConfig;
use tcm_metrics::MetricsConfig;

/// Complete configuration for the agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Control loop, budgets, jobs and rules
    #[serde(flatten)]
    pub core: CoreConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Instrumentation export
    pub metrics: MetricsConfig,

    /// Metrics backend queried for series counts
    pub backend: BackendConfig,

    /// Where drop-lists are persisted
    pub store: StoreConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `trace`, `debug`, `info`, `warn` or `error`; `RUST_LOG` overrides it
    pub level: String,

    /// `text` or `json`
    pub format: String,

    pub show_target: bool,
    pub show_thread_ids: bool,
    pub show_line_numbers: bool,
}

/// Prometheus HTTP API backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL, e.g. `http://prometheus:9090`
    pub url: String,

    /// Per-request timeout in seconds
    pub request_timeout_seconds: u64,
}

/// Configuration store kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// Process memory; decisions are lost on restart
    Memory,
    /// Relabel snippets under `path`
    File,
}

/// Configuration store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,

    /// Directory for relabel files
    pub path: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            show_target: true,
            show_thread_ids: false,
            show_line_numbers: false,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9090".to_string(),
            request_timeout_seconds: 10,
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::File,
            path: PathBuf::from("/etc/prometheus/tcm"),
        }
    }
}

impl AgentConfig {
    /// Load configuration with precedence environment > file > defaults
    ///
    /// Without an explicit path, `TCM_CONFIG`, `./tcm.yaml` and
    /// `/etc/tcm/config.yaml` are tried in that order. Environment variables
    /// use the `TCM_` prefix and `__` as the section separator, e.g.
    /// `TCM_BACKEND__URL`.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder().add_source(
            config::Config::try_from(&Self::default()).map_err(config_error)?,
        );

        match path {
            Some(path) => {
                builder = builder.add_source(config::File::from(path.to_path_buf()));
            }
            None => {
                if let Ok(config_path) = std::env::var("TCM_CONFIG") {
                    builder = builder.add_source(config::File::with_name(&config_path));
                } else {
                    for path in &["./tcm.yaml", "/etc/tcm/config.yaml"] {
                        builder = builder.add_source(config::File::with_name(path).required(false));
                    }
                }
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix("TCM")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(config_error)?;

        config.validate()?;
        Ok(config)
    }

    /// Read a YAML file without layering defaults or environment
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| invalid(format!("cannot read {}: {}", path.display(), e)))?;
        serde_yaml::from_str(&raw).map_err(|e| invalid(format!("cannot parse {}: {}", path.display(), e)))
    }

    /// Write the configuration as YAML
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let path = path.as_ref();
        let yaml = serde_yaml::to_string(self).map_err(|e| invalid(format!("cannot encode: {}", e)))?;
        std::fs::write(path, yaml).map_err(|e| invalid(format!("cannot write {}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.core.validate().map_err(crate::AgentError::Core)?;

        if !matches!(self.logging.level.as_str(), "trace" | "debug" | "info" | "warn" | "error") {
            return Err(invalid(format!("unknown log level {:?}", self.logging.level)));
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(invalid(format!("unknown log format {:?}", self.logging.format)));
        }

        let url = &self.backend.url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(invalid(format!("backend url must be http(s): {}", url)));
        }
        if self.backend.request_timeout_seconds == 0 {
            return Err(invalid("backend request_timeout_seconds must be at least 1"));
        }
        if self.store.kind == StoreKind::File && self.store.path.as_os_str().is_empty() {
            return Err(invalid("file store needs a path"));
        }

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> crate::AgentError {
    crate::AgentError::Config(msg.into())
}

fn config_error(e: config::ConfigError) -> crate::AgentError {
    crate::AgentError::Core(tcm_core::Error::from(e))
}
