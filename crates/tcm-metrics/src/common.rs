//! Metric families exported by the cardinality manager

use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use tcm_core::{DropRecord, FailureKind};

/// Metrics describing drops, budgets and control loop health
#[derive(Debug, Clone)]
pub struct CardinalityMetrics {
    /// Metrics dropped per job
    pub metrics_dropped: IntCounterVec,

    /// Series removed by drops per job
    pub series_dropped: IntCounterVec,

    /// Current series per job
    pub job_series: IntGaugeVec,

    /// 1 while a job cannot meet its budget without dropping protected metrics
    pub budget_unsatisfiable: IntGaugeVec,

    /// Per-job failures by kind
    pub job_failures: IntCounterVec,

    /// Series currently held back from each remote-write destination
    pub remote_write_excluded_series: IntGaugeVec,

    /// Sum of all jobs' series in the last pass
    pub global_series: IntGauge,

    /// 1 while the global budget is exceeded
    pub global_budget_exceeded: IntGauge,

    pub passes: IntCounter,
    pub pass_duration: Histogram,
}

impl CardinalityMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            metrics_dropped: IntCounterVec::new(
                Opts::new("prometheus_tcm_metrics_dropped_total", "Metrics added to a job's drop-list"),
                &["job", "metric"],
            )?,
            series_dropped: IntCounterVec::new(
                Opts::new("tcm_series_dropped_total", "Series removed by dropping metrics"),
                &["job"],
            )?,
            job_series: IntGaugeVec::new(
                Opts::new("tcm_job_series", "Current active series per scrape job"),
                &["job"],
            )?,
            budget_unsatisfiable: IntGaugeVec::new(
                Opts::new(
                    "tcm_budget_unsatisfiable",
                    "Job budget unreachable without dropping protected metrics (1=standing)",
                ),
                &["job"],
            )?,
            job_failures: IntCounterVec::new(
                Opts::new("tcm_job_failures_total", "Per-job query and apply failures"),
                &["job", "kind"],
            )?,
            remote_write_excluded_series: IntGaugeVec::new(
                Opts::new(
                    "tcm_remote_write_excluded_series",
                    "Series excluded from forwarding to a remote-write destination",
                ),
                &["destination"],
            )?,
            global_series: IntGauge::new("tcm_global_series", "Active series across all scrape jobs")?,
            global_budget_exceeded: IntGauge::new(
                "tcm_global_budget_exceeded",
                "Global series budget exceeded (1=exceeded)",
            )?,
            passes: IntCounter::new("tcm_passes_total", "Completed control loop passes")?,
            pass_duration: Histogram::with_opts(
                HistogramOpts::new("tcm_pass_duration_seconds", "Duration of one control loop pass")
                    .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            )?,
        })
    }

    /// Register all metrics with the given registry
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.metrics_dropped.clone()))?;
        registry.register(Box::new(self.series_dropped.clone()))?;
        registry.register(Box::new(self.job_series.clone()))?;
        registry.register(Box::new(self.budget_unsatisfiable.clone()))?;
        registry.register(Box::new(self.job_failures.clone()))?;
        registry.register(Box::new(self.remote_write_excluded_series.clone()))?;
        registry.register(Box::new(self.global_series.clone()))?;
        registry.register(Box::new(self.global_budget_exceeded.clone()))?;
        registry.register(Box::new(self.passes.clone()))?;
        registry.register(Box::new(self.pass_duration.clone()))?;
        Ok(())
    }

    pub fn record_drop(&self, record: &DropRecord) {
        self.metrics_dropped
            .with_label_values(&[record.job.as_str(), record.metric.as_str()])
            .inc();
        self.series_dropped
            .with_label_values(&[record.job.as_str()])
            .inc_by(record.series_removed);
    }

    pub fn record_failure(&self, job: &str, kind: FailureKind) {
        self.job_failures.with_label_values(&[job, kind.as_str()]).inc();
    }

    pub fn set_unsatisfiable(&self, job: &str, standing: bool) {
        self.budget_unsatisfiable
            .with_label_values(&[job])
            .set(i64::from(standing));
    }
}

/// Clamp a series count into a gauge value
pub(crate) fn gauge_value(series: u64) -> i64 {
    i64::try_from(series).unwrap_or(i64::MAX)
}
