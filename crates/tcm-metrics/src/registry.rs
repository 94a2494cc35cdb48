//! Metrics registry tying the metric families to the exporter

use crate::common::{gauge_value, CardinalityMetrics};
use crate::prometheus_metrics::{encode, PrometheusExporter};
use crate::{MetricsError, Result};
use prometheus::Registry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tcm_core::{ControlEvent, InstrumentationSink};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Central registry for cardinality metrics and their export
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    inner: Arc<MetricsRegistryInner>,
}

#[derive(Debug)]
struct MetricsRegistryInner {
    registry: Arc<Registry>,

    /// Prometheus exporter (optional)
    prometheus_exporter: Mutex<Option<PrometheusExporter>>,

    has_exporter: bool,

    metrics: CardinalityMetrics,

    /// Constant labels applied to all metrics
    global_labels: HashMap<String, String>,

    /// Shared with the exporter's `/health`
    healthy: Arc<AtomicBool>,
}

impl MetricsRegistry {
    pub(crate) fn new(
        prometheus_endpoint: Option<SocketAddr>,
        global_labels: HashMap<String, String>,
    ) -> Result<Self> {
        let const_labels = if global_labels.is_empty() {
            None
        } else {
            Some(global_labels.clone())
        };
        let registry = Arc::new(Registry::new_custom(None, const_labels)?);

        let metrics = CardinalityMetrics::new()
            .map_err(|e| MetricsError::Registry(format!("Failed to create cardinality metrics: {}", e)))?;
        metrics
            .register(&registry)
            .map_err(|e| MetricsError::Registry(format!("Failed to register metrics: {}", e)))?;

        let healthy = Arc::new(AtomicBool::new(true));
        let prometheus_exporter = prometheus_endpoint
            .map(|addr| PrometheusExporter::new(registry.clone(), healthy.clone(), addr));

        let inner = MetricsRegistryInner {
            registry,
            has_exporter: prometheus_exporter.is_some(),
            prometheus_exporter: Mutex::new(prometheus_exporter),
            metrics,
            global_labels,
            healthy,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn metrics(&self) -> &CardinalityMetrics {
        &self.inner.metrics
    }

    pub fn global_labels(&self) -> &HashMap<String, String> {
        &self.inner.global_labels
    }

    /// Whether a Prometheus endpoint is configured
    pub fn has_exporter(&self) -> bool {
        self.inner.has_exporter
    }

    /// Start all configured exporters
    pub async fn start_exporters(&self) -> Result<Option<SocketAddr>> {
        let mut guard = self.inner.prometheus_exporter.lock().await;
        let Some(exporter) = guard.as_mut() else {
            return Ok(None);
        };

        exporter.start_server().await?;
        info!("Prometheus exporter started at {}", exporter.metrics_url());
        Ok(exporter.local_addr())
    }

    /// Stop all exporters
    pub async fn stop_exporters(&self) {
        if let Some(exporter) = self.inner.prometheus_exporter.lock().await.as_mut() {
            info!("Stopping metrics exporter");
            exporter.stop_server().await;
        }
    }

    /// Current metrics in Prometheus text format
    pub fn export_text(&self) -> Result<String> {
        encode(&self.inner.registry)
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::Relaxed)
    }

    /// Fail `/health` until [`mark_healthy`](Self::mark_healthy)
    pub fn mark_unhealthy(&self, reason: &str) {
        error!(reason = %reason, "Reporting unhealthy");
        self.inner.healthy.store(false, Ordering::Relaxed);
    }

    pub fn mark_healthy(&self) {
        self.inner.healthy.store(true, Ordering::Relaxed);
    }
}

impl InstrumentationSink for MetricsRegistry {
    fn emit(&self, event: &ControlEvent) {
        let metrics = &self.inner.metrics;

        match event {
            ControlEvent::Dropped(record) => {
                metrics.record_drop(record);
                info!(
                    target: "tcm::events",
                    event = event.name(),
                    job = %record.job,
                    metric = %record.metric,
                    series_removed = record.series_removed,
                    "Metric dropped"
                );
            }
            ControlEvent::BudgetUnsatisfiable {
                job,
                protected_series,
                budget,
            } => {
                metrics.set_unsatisfiable(job, true);
                warn!(
                    target: "tcm::events",
                    event = event.name(),
                    job = %job,
                    protected_series,
                    budget,
                    "Budget unsatisfiable without dropping protected metrics"
                );
            }
            ControlEvent::BudgetSatisfiable { job } => {
                metrics.set_unsatisfiable(job, false);
                info!(target: "tcm::events", event = event.name(), job = %job, "Budget satisfiable again");
            }
            ControlEvent::JobFailed { job, kind, error } => {
                metrics.record_failure(job, *kind);
                warn!(
                    target: "tcm::events",
                    event = event.name(),
                    job = %job,
                    kind = %kind,
                    error = %error,
                    "Job failed this pass"
                );
            }
            ControlEvent::ConfigInconsistency { job } => {
                warn!(
                    target: "tcm::events",
                    event = event.name(),
                    job = %job,
                    "Budget configured for unknown scrape job"
                );
            }
            ControlEvent::GlobalBudgetExceeded {
                total_series,
                budget,
            } => {
                warn!(
                    target: "tcm::events",
                    event = event.name(),
                    total_series,
                    budget,
                    "Global series budget exceeded"
                );
            }
            ControlEvent::RemoteWriteRestricted {
                destination,
                job,
                metric,
                series,
            } => {
                info!(
                    target: "tcm::events",
                    event = event.name(),
                    destination = %destination,
                    job = %job,
                    metric = %metric,
                    series,
                    "Metric excluded from remote write"
                );
            }
            ControlEvent::RemoteWriteUnsatisfiable {
                destination,
                job,
                remaining_series,
                budget,
            } => {
                warn!(
                    target: "tcm::events",
                    event = event.name(),
                    destination = %destination,
                    job = job.as_deref().unwrap_or("*"),
                    remaining_series,
                    budget,
                    "Remote-write budget unsatisfiable"
                );
            }
        }
    }

    fn set_job_series(&self, job: &str, series: u64) {
        self.inner
            .metrics
            .job_series
            .with_label_values(&[job])
            .set(gauge_value(series));
    }

    fn set_global_series(&self, series: u64) {
        self.inner.metrics.global_series.set(gauge_value(series));
    }

    fn set_global_budget_exceeded(&self, exceeded: bool) {
        self.inner
            .metrics
            .global_budget_exceeded
            .set(i64::from(exceeded));
    }

    fn set_remote_write_excluded(&self, destination: &str, series: u64) {
        self.inner
            .metrics
            .remote_write_excluded_series
            .with_label_values(&[destination])
            .set(gauge_value(series));
    }

    fn record_pass(&self, duration: Duration) {
        self.inner.metrics.passes.inc();
        self.inner.metrics.pass_duration.observe(duration.as_secs_f64());
    }
}

/// Builder for creating a MetricsRegistry
#[derive(Debug, Default)]
pub struct MetricsRegistryBuilder {
    prometheus_endpoint: Option<SocketAddr>,
    global_labels: HashMap<String, String>,
}

impl MetricsRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve metrics on `addr`
    pub fn with_prometheus_endpoint(mut self, addr: SocketAddr) -> Self {
        self.prometheus_endpoint = Some(addr);
        self
    }

    /// Add a global label
    pub fn with_global_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.global_labels.insert(key.into(), value.into());
        self
    }

    /// Add multiple global labels
    pub fn with_global_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.global_labels.extend(labels);
        self
    }

    pub fn build(self) -> Result<MetricsRegistry> {
        MetricsRegistry::new(self.prometheus_endpoint, self.global_labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tcm_core::{DropRecord, FailureKind, MetricCandidate};

    #[test]
    fn test_registry_builder() {
        let registry = MetricsRegistryBuilder::new()
            .with_prometheus_endpoint("127.0.0.1:0".parse().unwrap())
            .with_global_label("cluster", "eu-1")
            .build()
            .unwrap();

        assert!(registry.is_healthy());
        assert!(registry.has_exporter());
        assert_eq!(registry.global_labels().get("cluster"), Some(&"eu-1".to_string()));
    }

    #[test]
    fn test_sink_updates_metrics() {
        let registry = MetricsRegistryBuilder::new().build().unwrap();
        let record = DropRecord::new(&MetricCandidate::new("api", "m1", 200, 900));

        registry.emit(&ControlEvent::Dropped(record));
        registry.emit(&ControlEvent::JobFailed {
            job: "beta".to_string(),
            kind: FailureKind::Apply,
            error: "store unavailable".to_string(),
        });
        registry.set_job_series("api", 1300);
        registry.set_global_series(4000);
        registry.record_pass(Duration::from_millis(250));

        let metrics = registry.metrics();
        assert_eq!(metrics.metrics_dropped.with_label_values(&["api", "m1"]).get(), 1);
        assert_eq!(metrics.series_dropped.with_label_values(&["api"]).get(), 200);
        assert_eq!(metrics.job_failures.with_label_values(&["beta", "apply"]).get(), 1);
        assert_eq!(metrics.job_series.with_label_values(&["api"]).get(), 1300);
        assert_eq!(metrics.global_series.get(), 4000);
        assert_eq!(metrics.passes.get(), 1);
    }

    #[test]
    fn test_unsatisfiable_gauge_follows_events() {
        let registry = MetricsRegistryBuilder::new().build().unwrap();

        registry.emit(&ControlEvent::BudgetUnsatisfiable {
            job: "api".to_string(),
            protected_series: 2000,
            budget: 1000,
        });
        assert_eq!(registry.metrics().budget_unsatisfiable.with_label_values(&["api"]).get(), 1);

        registry.emit(&ControlEvent::BudgetSatisfiable { job: "api".to_string() });
        assert_eq!(registry.metrics().budget_unsatisfiable.with_label_values(&["api"]).get(), 0);
    }

    #[test]
    fn test_export_text_carries_global_labels() {
        let registry = MetricsRegistryBuilder::new()
            .with_global_label("cluster", "eu-1")
            .build()
            .unwrap();
        registry.set_job_series("api", 7);

        let text = registry.export_text().unwrap();
        let line = text
            .lines()
            .find(|line| line.starts_with("tcm_job_series{"))
            .unwrap();
        assert!(line.contains("cluster=\"eu-1\""));
        assert!(line.contains("job=\"api\""));
        assert!(line.ends_with(" 7"));
    }

    #[tokio::test]
    async fn test_registry_lifecycle() {
        let registry = MetricsRegistryBuilder::new()
            .with_prometheus_endpoint("127.0.0.1:0".parse().unwrap())
            .build()
            .unwrap();

        let addr = registry.start_exporters().await.unwrap();
        assert!(addr.is_some());

        registry.stop_exporters().await;
        registry.mark_unhealthy("test reason");
        assert!(!registry.is_healthy());
        registry.mark_healthy();
        assert!(registry.is_healthy());
    }
}
