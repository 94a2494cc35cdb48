//! Per-job cardinality estimation

use crate::{with_timeout, EngineError, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tcm_core::{LabelSet, MetricCandidate, MetricsBackend, ScrapeJob};
use tracing::debug;

/// Current cardinality of one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Estimate {
    pub job: String,
    pub total_series: u64,
    /// One entry per emitted metric, sorted by metric name
    pub candidates: Vec<MetricCandidate>,
}

/// Measures series counts and byte costs through the metrics backend
#[derive(Clone)]
pub struct Estimator {
    backend: Arc<dyn MetricsBackend>,
    sample_size: usize,
    timeout: Duration,
}

impl Estimator {
    pub fn new(backend: Arc<dyn MetricsBackend>, sample_size: usize, timeout: Duration) -> Self {
        Self {
            backend,
            sample_size: sample_size.max(1),
            timeout,
        }
    }

    /// Estimate a job's cardinality
    ///
    /// Metrics in `suppressed` are already on the job's drop-list; any series
    /// the backend still reports for them are stale and left out. The whole
    /// estimate is bounded by the query timeout.
    pub async fn estimate(&self, job: &ScrapeJob, suppressed: &BTreeSet<String>) -> Result<Estimate> {
        let operation = format!("estimate for job {}", job.name);
        with_timeout(&operation, self.timeout, self.estimate_inner(job, suppressed)).await
    }

    async fn estimate_inner(&self, job: &ScrapeJob, suppressed: &BTreeSet<String>) -> Result<Estimate> {
        let series = self
            .backend
            .current_series(&job.selector)
            .await
            .map_err(|e| EngineError::Estimate(format!("series count for job {}: {}", job.name, e)))?;

        let mut metrics: Vec<(String, u64)> = series
            .into_iter()
            .filter(|(metric, count)| *count > 0 && !suppressed.contains(metric))
            .collect();
        metrics.sort();

        let mut total_series = 0u64;
        let mut candidates = Vec::with_capacity(metrics.len());

        for (metric, series_count) in metrics {
            let samples = self
                .backend
                .sample_label_sets(&metric, &job.selector, self.sample_size)
                .await
                .map_err(|e| {
                    EngineError::Estimate(format!(
                        "label samples of {} for job {}: {}",
                        metric, job.name, e
                    ))
                })?;

            let average = average_label_bytes(&metric, &samples[..samples.len().min(self.sample_size)]);
            let bytes_cost = (series_count as f64 * average).round() as u64;

            total_series = total_series.saturating_add(series_count);
            candidates.push(MetricCandidate::new(&job.name, metric, series_count, bytes_cost));
        }

        debug!(
            job = %job.name,
            total_series,
            metrics = candidates.len(),
            "Estimated job cardinality"
        );

        Ok(Estimate {
            job: job.name.clone(),
            total_series,
            candidates,
        })
    }
}

/// Mean serialized size of the sampled label sets
///
/// Falls back to the metric name length when nothing could be sampled.
pub fn average_label_bytes(metric: &str, samples: &[LabelSet]) -> f64 {
    if samples.is_empty() {
        return metric.len() as f64;
    }

    let total: usize = samples.iter().map(LabelSet::serialized_len).sum();
    total as f64 / samples.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tcm_core::MockMetricsBackend;

    fn estimator(backend: MockMetricsBackend) -> Estimator {
        Estimator::new(Arc::new(backend), 5, Duration::from_secs(10))
    }

    #[test]
    fn test_average_label_bytes() {
        let samples = vec![
            LabelSet::new().with("a", "b"),        // 7 bytes
            LabelSet::new().with("a", "bbb"),      // 9 bytes
        ];
        assert_eq!(average_label_bytes("m", &samples), 8.0);
        assert_eq!(average_label_bytes("metric", &[]), 6.0);
    }

    #[tokio::test]
    async fn test_estimate_totals_and_costs() {
        let samples = vec![
            LabelSet::new().with("a", "b"),
            LabelSet::new().with("a", "bbb"),
        ];
        let backend = MockMetricsBackend::new()
            .with_job("api", [("m1", 200), ("m2", 300)])
            .with_samples("api", "m1", samples.clone())
            .with_samples("api", "m2", samples);

        let estimate = estimator(backend)
            .estimate(&ScrapeJob::new("api"), &BTreeSet::new())
            .await
            .unwrap();

        assert_eq!(estimate.total_series, 500);
        assert_eq!(estimate.candidates.len(), 2);
        assert_eq!(estimate.candidates[0], MetricCandidate::new("api", "m1", 200, 1600));
        assert_eq!(estimate.candidates[1], MetricCandidate::new("api", "m2", 300, 2400));
    }

    #[tokio::test]
    async fn test_estimate_skips_suppressed_and_empty() {
        let backend = MockMetricsBackend::new().with_job("api", [("m1", 200), ("m2", 300), ("m3", 0)]);
        let suppressed: BTreeSet<String> = ["m1".to_string()].into_iter().collect();

        let estimate = estimator(backend)
            .estimate(&ScrapeJob::new("api"), &suppressed)
            .await
            .unwrap();

        assert_eq!(estimate.total_series, 300);
        assert_eq!(estimate.candidates.len(), 1);
        assert_eq!(estimate.candidates[0].metric, "m2");
    }

    #[tokio::test]
    async fn test_estimate_sample_size_is_bounded() {
        let samples: Vec<LabelSet> = (0..20)
            .map(|i| LabelSet::new().with("id", "x".repeat(i + 1)))
            .collect();
        let backend = MockMetricsBackend::new()
            .with_job("api", [("m1", 10)])
            .with_samples("api", "m1", samples);

        let estimate = estimator(backend)
            .estimate(&ScrapeJob::new("api"), &BTreeSet::new())
            .await
            .unwrap();

        // First five samples: {id="x"} .. {id="xxxxx"} => 8..12 bytes, mean 10
        assert_eq!(estimate.candidates[0].bytes_cost, 100);
    }

    #[tokio::test]
    async fn test_estimate_query_failure() {
        let backend = MockMetricsBackend::new()
            .with_job("beta", [("m1", 10)])
            .with_failing_job("beta");

        let err = estimator(backend)
            .estimate(&ScrapeJob::new("beta"), &BTreeSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Estimate(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_estimate_timeout() {
        let backend = MockMetricsBackend::new()
            .with_job("beta", [("m1", 10)])
            .with_delay("beta", Duration::from_secs(60));

        let err = estimator(backend)
            .estimate(&ScrapeJob::new("beta"), &BTreeSet::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }));
    }
}
