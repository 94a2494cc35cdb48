//! Core type definitions for tcm

use crate::config::ScrapeJobConfig;
use crate::labels::{LabelSet, JOB_LABEL};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A named group of monitored targets sharing one collection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeJob {
    /// Job name
    pub name: String,

    /// Label matchers selecting the job's series in the backend
    pub selector: LabelSet,

    /// Metrics excluded by static configuration
    pub drop_list: BTreeSet<String>,
}

impl ScrapeJob {
    /// Create a job selecting `{job="<name>"}`
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let selector = LabelSet::new().with(JOB_LABEL, name.clone());
        Self {
            name,
            selector,
            drop_list: BTreeSet::new(),
        }
    }

    /// Builder pattern for the selector
    pub fn with_selector(mut self, selector: LabelSet) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_dropped(mut self, metric: impl Into<String>) -> Self {
        self.drop_list.insert(metric.into());
        self
    }
}

impl From<&ScrapeJobConfig> for ScrapeJob {
    fn from(config: &ScrapeJobConfig) -> Self {
        let selector = if config.selector.is_empty() {
            LabelSet::new().with(JOB_LABEL, config.name.clone())
        } else {
            config.selector.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        Self {
            name: config.name.clone(),
            selector,
            drop_list: config.drop_list.iter().cloned().collect(),
        }
    }
}

/// A metric a job emits, with its measured cardinality and estimated cost
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricCandidate {
    pub job: String,
    pub metric: String,
    pub series_count: u64,
    /// `series_count * average label-set bytes`
    pub bytes_cost: u64,
}

impl MetricCandidate {
    pub fn new(
        job: impl Into<String>,
        metric: impl Into<String>,
        series_count: u64,
        bytes_cost: u64,
    ) -> Self {
        Self {
            job: job.into(),
            metric: metric.into(),
            series_count,
            bytes_cost,
        }
    }
}

/// Metric names that must never be dropped
///
/// Built from alerting and recording rule expressions and replaced wholesale
/// on every configuration reload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeepSet(BTreeSet<String>);

impl KeepSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, metric: &str) -> bool {
        self.0.contains(metric)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for KeepSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Audit record of one metric suppressed for one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropRecord {
    pub job: String,
    pub metric: String,
    pub series_removed: u64,
    pub timestamp: DateTime<Utc>,
}

impl DropRecord {
    pub fn new(candidate: &MetricCandidate) -> Self {
        Self {
            job: candidate.job.clone(),
            metric: candidate.metric.clone(),
            series_removed: candidate.series_count,
            timestamp: Utc::now(),
        }
    }
}

/// Metrics excluded from forwarding to one remote-write destination
///
/// Scoped to the remote-write path only; local scraping is unaffected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteWriteRestriction {
    pub destination: String,

    /// Excluded metric names keyed by job
    pub excluded: BTreeMap<String, BTreeSet<String>>,
}

impl RemoteWriteRestriction {
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            excluded: BTreeMap::new(),
        }
    }

    pub fn is_excluded(&self, job: &str, metric: &str) -> bool {
        self.excluded
            .get(job)
            .map(|metrics| metrics.contains(metric))
            .unwrap_or(false)
    }

    /// Add an exclusion, returning whether it was new
    pub fn exclude(&mut self, job: impl Into<String>, metric: impl Into<String>) -> bool {
        self.excluded
            .entry(job.into())
            .or_default()
            .insert(metric.into())
    }

    /// Total number of (job, metric) exclusions
    pub fn len(&self) -> usize {
        self.excluded.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Kind of per-job failure surfaced by the control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The estimator could not get fresh data for the job
    Query,
    /// The drop decision could not be persisted
    Apply,
    /// The job's task died before reporting
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Query => "query",
            FailureKind::Apply => "apply",
            FailureKind::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instrumentation event emitted by the control loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlEvent {
    /// A metric was added to a job's drop-list
    Dropped(DropRecord),

    /// Protected metrics alone keep a job over budget
    BudgetUnsatisfiable {
        job: String,
        protected_series: u64,
        budget: u64,
    },

    /// A previously unsatisfiable job is back within reach of its budget
    BudgetSatisfiable { job: String },

    /// A job was skipped or its plan discarded this tick
    JobFailed {
        job: String,
        kind: FailureKind,
        error: String,
    },

    /// A budgeted job name has no matching scrape job
    ConfigInconsistency { job: String },

    /// The sum of all jobs' series exceeds the global budget
    GlobalBudgetExceeded { total_series: u64, budget: u64 },

    /// A metric was excluded from forwarding to a remote-write destination
    RemoteWriteRestricted {
        destination: String,
        job: String,
        metric: String,
        series: u64,
    },

    /// Remote-write ceiling cannot be met without forwarding protected metrics
    ///
    /// `job` is set when a per-job limit is the ceiling, in which case
    /// `budget` is that job's limit.
    RemoteWriteUnsatisfiable {
        destination: String,
        job: Option<String>,
        remaining_series: u64,
        budget: u64,
    },
}

impl ControlEvent {
    /// Stable event name for logs
    pub fn name(&self) -> &'static str {
        match self {
            ControlEvent::Dropped(_) => "dropped",
            ControlEvent::BudgetUnsatisfiable { .. } => "budget_unsatisfiable",
            ControlEvent::BudgetSatisfiable { .. } => "budget_satisfiable",
            ControlEvent::JobFailed { .. } => "job_failed",
            ControlEvent::ConfigInconsistency { .. } => "config_inconsistency",
            ControlEvent::GlobalBudgetExceeded { .. } => "global_budget_exceeded",
            ControlEvent::RemoteWriteRestricted { .. } => "remote_write_restricted",
            ControlEvent::RemoteWriteUnsatisfiable { .. } => "remote_write_unsatisfiable",
        }
    }

    /// Job the event concerns, if any
    pub fn job(&self) -> Option<&str> {
        match self {
            ControlEvent::Dropped(record) => Some(&record.job),
            ControlEvent::BudgetUnsatisfiable { job, .. }
            | ControlEvent::BudgetSatisfiable { job }
            | ControlEvent::JobFailed { job, .. }
            | ControlEvent::ConfigInconsistency { job }
            | ControlEvent::RemoteWriteRestricted { job, .. } => Some(job),
            ControlEvent::RemoteWriteUnsatisfiable { job, .. } => job.as_deref(),
            ControlEvent::GlobalBudgetExceeded { .. } => None,
        }
    }
}
