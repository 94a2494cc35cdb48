//! Core traits for tcm components
//!
//! These traits define the seams between the cardinality-control loop and its
//! external collaborators: the metrics backend it measures, the configuration
//! store it writes drop decisions to, the instrumentation it emits and the
//! tick source that drives it.

use crate::{ControlEvent, LabelSet, RemoteWriteRestriction, Result};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

/// Query interface of the metrics backend
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    /// Active series count per metric name for the series matching `selector`
    async fn current_series(&self, selector: &LabelSet) -> Result<HashMap<String, u64>>;

    /// Up to `limit` label sets of `metric` within `selector`
    async fn sample_label_sets(
        &self,
        metric: &str,
        selector: &LabelSet,
        limit: usize,
    ) -> Result<Vec<LabelSet>>;
}

/// Key-value configuration store the scraper re-reads from
///
/// Writes are last-writer-wins per key; callers serialize writes per job.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Current drop-list of a job (empty if never written)
    async fn read_drop_list(&self, job: &str) -> Result<BTreeSet<String>>;

    /// Replace the drop-list of a job
    async fn write_drop_list(&self, job: &str, drop_list: &BTreeSet<String>) -> Result<()>;

    /// Current remote-write restriction for a destination
    async fn read_remote_write_restriction(
        &self,
        destination: &str,
    ) -> Result<RemoteWriteRestriction>;

    /// Replace the remote-write restriction for its destination
    async fn write_remote_write_restriction(
        &self,
        restriction: &RemoteWriteRestriction,
    ) -> Result<()>;
}

/// Sink for counters, gauges and the control event stream
pub trait InstrumentationSink: Send + Sync {
    /// Emit one control event
    fn emit(&self, event: &ControlEvent);

    /// Current series count of a job
    fn set_job_series(&self, job: &str, series: u64);

    /// Sum of all jobs' series seen in the last pass
    fn set_global_series(&self, _series: u64) {}

    /// Whether the global budget is exceeded as of the last pass
    fn set_global_budget_exceeded(&self, _exceeded: bool) {}

    /// Series currently excluded from a remote-write destination
    fn set_remote_write_excluded(&self, _destination: &str, _series: u64) {}

    /// Duration of one completed pass
    fn record_pass(&self, _duration: Duration) {}
}

/// Source of control loop ticks
#[async_trait]
pub trait TickSource: Send {
    /// Wait for the next tick; `false` means the source is exhausted
    async fn tick(&mut self) -> bool;
}

/// Mock implementations for testing and development

/// Mock metrics backend with per-job series, failures and delays
#[derive(Debug, Default)]
pub struct MockMetricsBackend {
    /// Series per metric, keyed by the `job` label of the selector
    series: RwLock<HashMap<String, HashMap<String, u64>>>,

    /// Sampled label sets, keyed by (job, metric)
    samples: RwLock<HashMap<(String, String), Vec<LabelSet>>>,

    failing_jobs: RwLock<HashSet<String>>,
    delays: RwLock<HashMap<String, Duration>>,
    queries: AtomicU64,
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
}

impl MockMetricsBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pattern for a job's series
    pub fn with_job<I, S>(self, job: &str, metrics: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        self.set_job(job, metrics);
        self
    }

    /// Builder pattern for sampled label sets
    pub fn with_samples(self, job: &str, metric: &str, samples: Vec<LabelSet>) -> Self {
        write_lock(&self.samples).insert((job.to_string(), metric.to_string()), samples);
        self
    }

    /// Builder pattern for a job whose queries fail
    pub fn with_failing_job(self, job: &str) -> Self {
        self.set_failing(job, true);
        self
    }

    /// Builder pattern for a job whose queries are slow
    pub fn with_delay(self, job: &str, delay: Duration) -> Self {
        write_lock(&self.delays).insert(job.to_string(), delay);
        self
    }

    /// Replace a job's series
    pub fn set_job<I, S>(&self, job: &str, metrics: I)
    where
        I: IntoIterator<Item = (S, u64)>,
        S: Into<String>,
    {
        let metrics = metrics.into_iter().map(|(m, c)| (m.into(), c)).collect();
        write_lock(&self.series).insert(job.to_string(), metrics);
    }

    /// Toggle failures for a job
    pub fn set_failing(&self, job: &str, failing: bool) {
        let mut failing_jobs = write_lock(&self.failing_jobs);
        if failing {
            failing_jobs.insert(job.to_string());
        } else {
            failing_jobs.remove(job);
        }
    }

    /// Number of queries served so far
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    /// Most delayed queries ever pending at once
    pub fn peak_in_flight(&self) -> u64 {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn simulate(&self, job: &str) -> Result<()> {
        self.queries.fetch_add(1, Ordering::Relaxed);

        let delay = read_lock(&self.delays).get(job).copied();
        if let Some(delay) = delay {
            let pending = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(pending, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        if read_lock(&self.failing_jobs).contains(job) {
            return Err(crate::Error::query(format!("backend unavailable for job {}", job)));
        }

        Ok(())
    }
}

#[async_trait]
impl MetricsBackend for MockMetricsBackend {
    async fn current_series(&self, selector: &LabelSet) -> Result<HashMap<String, u64>> {
        let job = selector.get(crate::labels::JOB_LABEL).unwrap_or_default().to_string();
        self.simulate(&job).await?;

        Ok(read_lock(&self.series).get(&job).cloned().unwrap_or_default())
    }

    async fn sample_label_sets(
        &self,
        metric: &str,
        selector: &LabelSet,
        limit: usize,
    ) -> Result<Vec<LabelSet>> {
        let job = selector.get(crate::labels::JOB_LABEL).unwrap_or_default().to_string();
        self.simulate(&job).await?;

        let configured = read_lock(&self.samples)
            .get(&(job.clone(), metric.to_string()))
            .cloned();

        let samples = match configured {
            Some(samples) => samples,
            None => vec![selector.clone().with(crate::labels::METRIC_NAME_LABEL, metric)],
        };

        Ok(samples.into_iter().take(limit).collect())
    }
}

/// Instrumentation sink that records everything in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ControlEvent>>,
    job_series: Mutex<HashMap<String, u64>>,
    global_series: AtomicU64,
    remote_write_excluded: Mutex<HashMap<String, u64>>,
    passes: AtomicU64,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events emitted so far, in order
    pub fn events(&self) -> Vec<ControlEvent> {
        lock(&self.events).clone()
    }

    /// Metric names dropped for a job, in emission order
    pub fn dropped(&self, job: &str) -> Vec<String> {
        lock(&self.events)
            .iter()
            .filter_map(|event| match event {
                ControlEvent::Dropped(record) if record.job == job => Some(record.metric.clone()),
                _ => None,
            })
            .collect()
    }

    /// Last series count reported for a job
    pub fn job_series(&self, job: &str) -> Option<u64> {
        lock(&self.job_series).get(job).copied()
    }

    pub fn global_series(&self) -> u64 {
        self.global_series.load(Ordering::Relaxed)
    }

    /// Last excluded series count reported for a destination
    pub fn remote_write_excluded(&self, destination: &str) -> Option<u64> {
        lock(&self.remote_write_excluded).get(destination).copied()
    }

    pub fn pass_count(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

impl InstrumentationSink for RecordingSink {
    fn emit(&self, event: &ControlEvent) {
        lock(&self.events).push(event.clone());
    }

    fn set_job_series(&self, job: &str, series: u64) {
        lock(&self.job_series).insert(job.to_string(), series);
    }

    fn set_global_series(&self, series: u64) {
        self.global_series.store(series, Ordering::Relaxed);
    }

    fn set_remote_write_excluded(&self, destination: &str, series: u64) {
        lock(&self.remote_write_excluded).insert(destination.to_string(), series);
    }

    fn record_pass(&self, _duration: Duration) {
        self.passes.fetch_add(1, Ordering::Relaxed);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DropRecord, MetricCandidate};

    fn api_selector() -> LabelSet {
        LabelSet::new().with("job", "api")
    }

    #[tokio::test]
    async fn test_mock_backend_series() {
        let backend = MockMetricsBackend::new().with_job("api", [("m1", 200), ("m2", 300)]);

        let series = backend.current_series(&api_selector()).await.unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series.get("m1"), Some(&200));

        let unknown = backend
            .current_series(&LabelSet::new().with("job", "other"))
            .await
            .unwrap();
        assert!(unknown.is_empty());
        assert_eq!(backend.query_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_backend_samples() {
        let samples = vec![
            LabelSet::new().with("__name__", "m1").with("path", "/a"),
            LabelSet::new().with("__name__", "m1").with("path", "/b"),
            LabelSet::new().with("__name__", "m1").with("path", "/c"),
        ];
        let backend = MockMetricsBackend::new()
            .with_job("api", [("m1", 3)])
            .with_samples("api", "m1", samples);

        let sampled = backend.sample_label_sets("m1", &api_selector(), 2).await.unwrap();
        assert_eq!(sampled.len(), 2);

        let default = backend.sample_label_sets("m2", &api_selector(), 5).await.unwrap();
        assert_eq!(default.len(), 1);
        assert_eq!(default[0].metric_name(), Some("m2"));
    }

    #[tokio::test]
    async fn test_mock_backend_failures() {
        let backend = MockMetricsBackend::new()
            .with_job("api", [("m1", 1)])
            .with_failing_job("api");

        let err = backend.current_series(&api_selector()).await.unwrap_err();
        assert!(matches!(err, crate::Error::QueryFailure(_)));

        backend.set_failing("api", false);
        assert!(backend.current_series(&api_selector()).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_backend_delay() {
        let backend = MockMetricsBackend::new()
            .with_job("api", [("m1", 1)])
            .with_delay("api", Duration::from_secs(30));

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            backend.current_series(&api_selector()),
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_recording_sink() {
        let sink = RecordingSink::new();
        let candidate = MetricCandidate::new("api", "m1", 200, 900);

        sink.emit(&ControlEvent::Dropped(DropRecord::new(&candidate)));
        sink.set_job_series("api", 1500);
        sink.record_pass(Duration::from_millis(5));

        assert_eq!(sink.dropped("api"), vec!["m1".to_string()]);
        assert!(sink.dropped("beta").is_empty());
        assert_eq!(sink.job_series("api"), Some(1500));
        assert_eq!(sink.pass_count(), 1);

        sink.clear();
        assert!(sink.events().is_empty());
    }
}
