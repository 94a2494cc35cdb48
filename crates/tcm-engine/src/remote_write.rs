//! Remote-write limiting
//!
//! Caps the series forwarded to one remote-write destination. Exclusions only
//! affect forwarding; local scraping and storage keep every series. Protected
//! metrics are always forwarded.

use crate::{planner, with_timeout, EngineError, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tcm_core::{
    ConfigStore, ControlEvent, InstrumentationSink, KeepSet, MetricCandidate, RemoteWriteConfig,
    RemoteWriteRestriction,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Metrics a job still emits locally after its own drops
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSurvivors {
    pub job: String,
    pub candidates: Vec<MetricCandidate>,
}

impl JobSurvivors {
    pub fn new(job: impl Into<String>, candidates: Vec<MetricCandidate>) -> Self {
        Self {
            job: job.into(),
            candidates,
        }
    }
}

/// Result of one limiting pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteWriteOutcome {
    pub destination: String,
    /// Series still forwarded after exclusions
    pub forwarded_series: u64,
    /// Series held back from the destination
    pub excluded_series: u64,
    /// (job, metric) pairs excluded during this pass
    pub newly_excluded: Vec<(String, String)>,
    /// Series over the budget that only protected metrics could cover
    pub unsatisfiable: Option<u64>,
    /// Jobs still over their own limit with only protected metrics left
    pub unsatisfiable_jobs: Vec<String>,
    pub written: bool,
}

/// Enforces the remote-write budget of one destination
pub struct RemoteWriteLimiter {
    config: RemoteWriteConfig,
    store: Arc<dyn ConfigStore>,
    sink: Arc<dyn InstrumentationSink>,
    timeout: Duration,
    lock: Mutex<()>,
}

impl RemoteWriteLimiter {
    pub fn new(
        config: RemoteWriteConfig,
        store: Arc<dyn ConfigStore>,
        sink: Arc<dyn InstrumentationSink>,
        timeout: Duration,
    ) -> Self {
        Self {
            config,
            store,
            sink,
            timeout,
            lock: Mutex::new(()),
        }
    }

    pub fn destination(&self) -> &str {
        &self.config.destination
    }

    async fn read(&self) -> Result<RemoteWriteRestriction> {
        let operation = format!("read remote-write restriction of {}", self.config.destination);
        with_timeout(&operation, self.timeout, async {
            self.store
                .read_remote_write_restriction(&self.config.destination)
                .await
                .map_err(|e| EngineError::Store(format!("{}: {}", operation, e)))
        })
        .await
    }

    async fn write(&self, restriction: &RemoteWriteRestriction) -> Result<()> {
        let operation = format!("write remote-write restriction of {}", self.config.destination);
        with_timeout(&operation, self.timeout, async {
            self.store
                .write_remote_write_restriction(restriction)
                .await
                .map_err(|e| EngineError::Apply(format!("{}: {}", operation, e)))
        })
        .await
    }

    /// Bring forwarded series within the per-job limits and the destination budget
    ///
    /// Exclusions accumulate across passes until [`clear`](Self::clear).
    pub async fn limit(&self, survivors: &[JobSurvivors], keep_set: &KeepSet) -> Result<RemoteWriteOutcome> {
        let _guard = self.lock.lock().await;
        let mut restriction = self.read().await?;
        let destination = self.config.destination.clone();

        let mut forwarded: BTreeMap<&str, Vec<MetricCandidate>> = BTreeMap::new();
        for job in survivors {
            let entry = forwarded.entry(job.job.as_str()).or_default();
            entry.extend(
                job.candidates
                    .iter()
                    .filter(|c| !restriction.is_excluded(&c.job, &c.metric))
                    .cloned(),
            );
        }

        let mut newly_excluded: Vec<MetricCandidate> = Vec::new();
        // (job, series still forwarded, limit)
        let mut over_job_limit: Vec<(String, u64, u64)> = Vec::new();

        for (job, limit) in &self.config.job_limits {
            let Some(candidates) = forwarded.get_mut(job.as_str()) else {
                continue;
            };
            let deficit = series(candidates).saturating_sub(*limit);
            if deficit == 0 {
                continue;
            }

            let plan = planner::plan(job, candidates, keep_set, deficit);
            exclude(&mut restriction, candidates, plan.selected, &mut newly_excluded);
            if plan.unsatisfiable.is_some() {
                over_job_limit.push((job.clone(), series(candidates), *limit));
            }
        }

        let remaining: Vec<MetricCandidate> = forwarded.values().flatten().cloned().collect();
        let deficit = series(&remaining).saturating_sub(self.config.budget);
        let mut unsatisfiable = None;

        if deficit > 0 {
            let plan = planner::plan(&destination, &remaining, keep_set, deficit);
            if let Some(shortfall) = &plan.unsatisfiable {
                unsatisfiable = Some(shortfall.remaining_deficit);
            }
            for candidate in plan.selected {
                if restriction.exclude(&candidate.job, &candidate.metric) {
                    newly_excluded.push(candidate);
                }
            }
        }

        let written = !newly_excluded.is_empty();
        if written {
            self.write(&restriction).await?;
        }

        let total: u64 = survivors.iter().map(|s| series(&s.candidates)).sum();
        let excluded_series: u64 = survivors
            .iter()
            .flat_map(|s| s.candidates.iter())
            .filter(|c| restriction.is_excluded(&c.job, &c.metric))
            .map(|c| c.series_count)
            .sum();
        let forwarded_series = total - excluded_series;

        for candidate in &newly_excluded {
            info!(
                destination = %destination,
                job = %candidate.job,
                metric = %candidate.metric,
                series = candidate.series_count,
                "Excluded metric from remote write"
            );
            self.sink.emit(&ControlEvent::RemoteWriteRestricted {
                destination: destination.clone(),
                job: candidate.job.clone(),
                metric: candidate.metric.clone(),
                series: candidate.series_count,
            });
        }

        for (job, remaining_series, limit) in &over_job_limit {
            warn!(
                destination = %destination,
                job = %job,
                remaining_series,
                limit,
                "Job remote-write limit cannot be met without excluding protected metrics"
            );
            self.sink.emit(&ControlEvent::RemoteWriteUnsatisfiable {
                destination: destination.clone(),
                job: Some(job.clone()),
                remaining_series: *remaining_series,
                budget: *limit,
            });
        }

        if unsatisfiable.is_some() {
            warn!(
                destination = %destination,
                forwarded_series,
                budget = self.config.budget,
                "Remote-write budget cannot be met without excluding protected metrics"
            );
            self.sink.emit(&ControlEvent::RemoteWriteUnsatisfiable {
                destination: destination.clone(),
                job: None,
                remaining_series: forwarded_series,
                budget: self.config.budget,
            });
        }

        self.sink.set_remote_write_excluded(&destination, excluded_series);

        debug!(
            destination = %destination,
            forwarded_series,
            excluded_series,
            "Remote-write limiting complete"
        );

        Ok(RemoteWriteOutcome {
            destination,
            forwarded_series,
            excluded_series,
            newly_excluded: newly_excluded
                .into_iter()
                .map(|c| (c.job, c.metric))
                .collect(),
            unsatisfiable,
            unsatisfiable_jobs: over_job_limit.into_iter().map(|(job, _, _)| job).collect(),
            written,
        })
    }

    /// Forward everything again
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.write(&RemoteWriteRestriction::new(&self.config.destination)).await?;
        self.sink.set_remote_write_excluded(&self.config.destination, 0);
        info!(destination = %self.config.destination, "Cleared remote-write restriction");
        Ok(())
    }
}

fn series(candidates: &[MetricCandidate]) -> u64 {
    candidates.iter().map(|c| c.series_count).sum()
}

/// Record `selected` as excluded and remove them from the forwarded set
fn exclude(
    restriction: &mut RemoteWriteRestriction,
    forwarded: &mut Vec<MetricCandidate>,
    selected: Vec<MetricCandidate>,
    newly_excluded: &mut Vec<MetricCandidate>,
) {
    for candidate in selected {
        forwarded.retain(|c| c.metric != candidate.metric);
        if restriction.exclude(&candidate.job, &candidate.metric) {
            newly_excluded.push(candidate);
        }
    }
}
