//! Configuration management for tcm
//!
//! The static configuration arrives already structured: scrape jobs, rule
//! expressions, budgets and loop settings. It is loaded from YAML files and
//! environment variables and is immutable for the lifetime of one snapshot.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Main configuration structure for the cardinality manager
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Control loop settings
    pub control: ControlConfig,

    /// Series budgets
    pub budgets: BudgetConfig,

    /// Remote-write budget, if a destination is configured
    pub remote_write: Option<RemoteWriteConfig>,

    /// Scrape jobs under management
    pub scrape_jobs: Vec<ScrapeJobConfig>,

    /// Alerting and recording rules whose metrics are protected
    pub rules: RulesConfig,
}

impl Config {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (highest)
    /// 2. Configuration file
    /// 3. Defaults (lowest)
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        if let Ok(config_path) = std::env::var("TCM_CONFIG") {
            builder = builder.add_source(config::File::with_name(&config_path).required(false));
        } else {
            for path in &["./tcm.yaml", "/etc/tcm/config.yaml"] {
                builder = builder.add_source(config::File::with_name(path).required(false));
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix("TCM")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let parsed: Self = config.try_deserialize()?;

        parsed.validate()?;
        debug!(jobs = parsed.scrape_jobs.len(), "Loaded configuration");

        Ok(parsed)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from(path.clone()));

        let config = builder.build()?;
        let parsed: Self = config.try_deserialize()?;
        parsed.validate()?;
        debug!(path = %path.display(), jobs = parsed.scrape_jobs.len(), "Loaded configuration");

        Ok(parsed)
    }

    /// Validate the configuration
    ///
    /// Budgets naming unknown jobs are not rejected here; see
    /// [`Config::unmatched_budgets`].
    pub fn validate(&self) -> Result<()> {
        self.control.validate()?;

        let mut seen = BTreeSet::new();
        for job in &self.scrape_jobs {
            job.validate()?;
            if !seen.insert(job.name.as_str()) {
                return Err(crate::Error::config(format!(
                    "Duplicate scrape job name: {}",
                    job.name
                )));
            }
        }

        if let Some(ref remote_write) = self.remote_write {
            remote_write.validate()?;
        }

        Ok(())
    }

    /// Budgeted job names with no matching scrape job
    pub fn unmatched_budgets(&self) -> Vec<String> {
        let jobs: BTreeSet<&str> = self.scrape_jobs.iter().map(|j| j.name.as_str()).collect();
        self.budgets
            .jobs
            .keys()
            .filter(|name| !jobs.contains(name.as_str()))
            .cloned()
            .collect()
    }
}

/// How per-job work is scheduled within a pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropMode {
    /// Query and evaluate every job at the same time, bounded by the worker limit
    #[default]
    Concurrent,
    /// One job at a time
    Sequential,
}

/// Control loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Interval between passes in seconds
    pub interval_seconds: u64,

    /// Timeout for one job's backend queries in seconds
    pub query_timeout_seconds: u64,

    /// Timeout for one configuration store operation in seconds
    pub apply_timeout_seconds: u64,

    /// Maximum number of jobs processed concurrently
    pub worker_limit: usize,

    /// Scheduling of per-job work
    pub drop_mode: DropMode,

    /// Label sets sampled per metric to estimate average label bytes
    pub label_sample_size: usize,

    /// Drop any unprotected metric costing more than this many bytes
    pub max_metric_cost_bytes: Option<u64>,
}

impl ControlConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval_seconds == 0 {
            return Err(crate::Error::config("Control interval must be > 0"));
        }

        if self.worker_limit == 0 {
            return Err(crate::Error::config("Worker limit must be > 0"));
        }

        if self.label_sample_size == 0 {
            return Err(crate::Error::config("Label sample size must be > 0"));
        }

        if self.query_timeout_seconds == 0 || self.apply_timeout_seconds == 0 {
            return Err(crate::Error::config("Timeouts must be > 0"));
        }

        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_seconds)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_seconds)
    }

    /// Worker limit after applying the drop mode
    pub fn effective_worker_limit(&self) -> usize {
        match self.drop_mode {
            DropMode::Concurrent => self.worker_limit,
            DropMode::Sequential => 1,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            query_timeout_seconds: 10,
            apply_timeout_seconds: 10,
            worker_limit: 4,
            drop_mode: DropMode::Concurrent,
            label_sample_size: 10,
            max_metric_cost_bytes: None,
        }
    }
}

/// Series budgets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Ceiling on the sum of all jobs' series
    pub global: Option<u64>,

    /// Per-job series ceilings
    pub jobs: BTreeMap<String, u64>,
}

/// Remote-write budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteWriteConfig {
    /// Destination name, as configured in the scraper's remote_write section
    pub destination: String,

    /// Ceiling on the total series forwarded to the destination
    pub budget: u64,

    /// Per-job forwarding ceilings
    #[serde(default)]
    pub job_limits: BTreeMap<String, u64>,
}

impl RemoteWriteConfig {
    pub fn validate(&self) -> Result<()> {
        if self.destination.is_empty() {
            return Err(crate::Error::config("Remote-write destination cannot be empty"));
        }

        Ok(())
    }
}

/// One scrape job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapeJobConfig {
    /// Job name
    pub name: String,

    /// Label matchers selecting the job's series; defaults to `job=<name>`
    pub selector: BTreeMap<String, String>,

    /// Metrics dropped by static configuration
    pub drop_list: Vec<String>,
}

impl ScrapeJobConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(crate::Error::config("Scrape job name cannot be empty"));
        }

        Ok(())
    }
}

/// An alerting rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertingRule {
    pub alert: String,
    pub expr: String,
}

/// A recording rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingRule {
    pub record: String,
    pub expr: String,
}

/// Rules whose referenced metrics must never be dropped
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    pub alerting: Vec<AlertingRule>,
    pub recording: Vec<RecordingRule>,

    /// Metric names protected regardless of rules
    pub extra_keep: Vec<String>,
}

impl RulesConfig {
    /// All rule expressions, alerting first
    pub fn expressions(&self) -> impl Iterator<Item = &str> {
        self.alerting
            .iter()
            .map(|r| r.expr.as_str())
            .chain(self.recording.iter().map(|r| r.expr.as_str()))
    }
}
