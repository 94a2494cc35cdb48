//! Drop-list application
//!
//! Drop decisions are merged into a job's persisted drop-list under a per-job
//! lock. Applying the same plan twice leaves the store unchanged and emits no
//! new records.

use crate::{with_timeout, EngineError, Result};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tcm_core::{ConfigStore, ControlEvent, DropRecord, InstrumentationSink, KeepSet, MetricCandidate};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Result of applying one job's plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub job: String,
    /// Drop-list persisted after the merge
    pub drop_list: BTreeSet<String>,
    /// Records for metrics that were not already dropped
    pub newly_dropped: Vec<DropRecord>,
    /// Whether the store was written
    pub written: bool,
}

/// Persists drop decisions to the configuration store
pub struct DropApplier {
    store: Arc<dyn ConfigStore>,
    sink: Arc<dyn InstrumentationSink>,
    timeout: Duration,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl DropApplier {
    pub fn new(store: Arc<dyn ConfigStore>, sink: Arc<dyn InstrumentationSink>, timeout: Duration) -> Self {
        Self {
            store,
            sink,
            timeout,
            locks: DashMap::new(),
        }
    }

    fn job_lock(&self, job: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(job.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Current persisted drop-list of a job
    pub async fn current(&self, job: &str) -> Result<BTreeSet<String>> {
        let operation = format!("read drop-list of job {}", job);
        with_timeout(&operation, self.timeout, async {
            self.store
                .read_drop_list(job)
                .await
                .map_err(|e| EngineError::Store(format!("{}: {}", operation, e)))
        })
        .await
    }

    /// Merge `selected` into the job's drop-list
    ///
    /// Protected metrics are never written, even if a caller passes them. If
    /// the write fails the persisted list is left as it was and no records
    /// are emitted.
    pub async fn apply(
        &self,
        job: &str,
        selected: &[MetricCandidate],
        keep_set: &KeepSet,
    ) -> Result<ApplyOutcome> {
        let lock = self.job_lock(job);
        let _guard = lock.lock().await;

        let mut drop_list = self.current(job).await?;
        let mut newly_dropped = Vec::new();

        for candidate in selected {
            if keep_set.contains(&candidate.metric) {
                warn!(job = %job, metric = %candidate.metric, "Refusing to drop protected metric");
                continue;
            }
            if drop_list.insert(candidate.metric.clone()) {
                newly_dropped.push(DropRecord::new(candidate));
            }
        }

        if newly_dropped.is_empty() {
            debug!(job = %job, "Drop-list already up to date");
            return Ok(ApplyOutcome {
                job: job.to_string(),
                drop_list,
                newly_dropped,
                written: false,
            });
        }

        let operation = format!("write drop-list of job {}", job);
        with_timeout(&operation, self.timeout, async {
            self.store
                .write_drop_list(job, &drop_list)
                .await
                .map_err(|e| EngineError::Apply(format!("{}: {}", operation, e)))
        })
        .await?;

        for record in &newly_dropped {
            info!(
                job = %record.job,
                metric = %record.metric,
                series_removed = record.series_removed,
                "Dropped metric"
            );
            self.sink.emit(&ControlEvent::Dropped(record.clone()));
        }

        Ok(ApplyOutcome {
            job: job.to_string(),
            drop_list,
            newly_dropped,
            written: true,
        })
    }

    /// Replace a job's drop-list wholesale
    ///
    /// Used on configuration reload to reinstate previously dropped metrics.
    pub async fn reset(&self, job: &str, drop_list: &BTreeSet<String>) -> Result<()> {
        let lock = self.job_lock(job);
        let _guard = lock.lock().await;

        let operation = format!("reset drop-list of job {}", job);
        with_timeout(&operation, self.timeout, async {
            self.store
                .write_drop_list(job, drop_list)
                .await
                .map_err(|e| EngineError::Apply(format!("{}: {}", operation, e)))
        })
        .await?;

        info!(job = %job, dropped = drop_list.len(), "Reset drop-list");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryConfigStore;
    use async_trait::async_trait;
    use tcm_core::{RecordingSink, RemoteWriteRestriction};

    /// Store whose reads take a while, leaving room for interleaved writers
    struct SlowReadStore(InMemoryConfigStore);

    #[async_trait]
    impl ConfigStore for SlowReadStore {
        async fn read_drop_list(&self, job: &str) -> tcm_core::Result<BTreeSet<String>> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.0.read_drop_list(job).await
        }

        async fn write_drop_list(&self, job: &str, drop_list: &BTreeSet<String>) -> tcm_core::Result<()> {
            self.0.write_drop_list(job, drop_list).await
        }

        async fn read_remote_write_restriction(
            &self,
            destination: &str,
        ) -> tcm_core::Result<RemoteWriteRestriction> {
            self.0.read_remote_write_restriction(destination).await
        }

        async fn write_remote_write_restriction(
            &self,
            restriction: &RemoteWriteRestriction,
        ) -> tcm_core::Result<()> {
            self.0.write_remote_write_restriction(restriction).await
        }
    }

    fn applier() -> (DropApplier, InMemoryConfigStore, Arc<RecordingSink>) {
        let store = InMemoryConfigStore::new();
        let sink = Arc::new(RecordingSink::new());
        let applier = DropApplier::new(Arc::new(store.clone()), sink.clone(), Duration::from_secs(5));
        (applier, store, sink)
    }

    fn candidates() -> Vec<MetricCandidate> {
        vec![
            MetricCandidate::new("api", "m1", 200, 900),
            MetricCandidate::new("api", "m2", 300, 500),
        ]
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let (applier, store, sink) = applier();

        let first = applier.apply("api", &candidates(), &KeepSet::new()).await.unwrap();
        assert!(first.written);
        assert_eq!(first.newly_dropped.len(), 2);

        let second = applier.apply("api", &candidates(), &KeepSet::new()).await.unwrap();
        assert!(!second.written);
        assert!(second.newly_dropped.is_empty());
        assert_eq!(first.drop_list, second.drop_list);

        assert_eq!(store.write_count(), 1);
        assert_eq!(sink.dropped("api"), vec!["m1".to_string(), "m2".to_string()]);
    }

    #[tokio::test]
    async fn test_apply_merges_with_existing() {
        let (applier, store, sink) = applier();
        let existing: BTreeSet<String> = ["static_metric".to_string()].into_iter().collect();
        store.write_drop_list("api", &existing).await.unwrap();

        let outcome = applier
            .apply("api", &candidates()[..1], &KeepSet::new())
            .await
            .unwrap();

        assert_eq!(outcome.drop_list.len(), 2);
        assert!(store.drop_list("api").contains("static_metric"));
        assert!(store.drop_list("api").contains("m1"));
        assert_eq!(sink.dropped("api"), vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn test_apply_never_writes_protected() {
        let (applier, store, _sink) = applier();
        let keep: KeepSet = ["m1"].into_iter().collect();

        let outcome = applier.apply("api", &candidates(), &keep).await.unwrap();

        assert_eq!(outcome.newly_dropped.len(), 1);
        assert!(!store.drop_list("api").contains("m1"));
        assert!(store.drop_list("api").contains("m2"));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_list_unchanged() {
        let (applier, store, sink) = applier();
        store.set_fail_writes(true);

        let err = applier.apply("api", &candidates(), &KeepSet::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::Apply(_)));
        assert!(store.drop_list("api").is_empty());
        assert!(sink.events().is_empty());

        store.set_fail_writes(false);
        let outcome = applier.apply("api", &candidates(), &KeepSet::new()).await.unwrap();
        assert_eq!(outcome.newly_dropped.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_applies_to_one_job_both_land() {
        let store = InMemoryConfigStore::new();
        let sink = Arc::new(RecordingSink::new());
        let applier = DropApplier::new(
            Arc::new(SlowReadStore(store.clone())),
            sink.clone(),
            Duration::from_secs(5),
        );
        let keep = KeepSet::new();
        let all = candidates();

        let (first, second) = tokio::join!(
            applier.apply("api", &all[..1], &keep),
            applier.apply("api", &all[1..], &keep),
        );
        first.unwrap();
        second.unwrap();

        let expected: BTreeSet<String> = ["m1".to_string(), "m2".to_string()].into_iter().collect();
        assert_eq!(store.drop_list("api"), expected);
        assert_eq!(store.write_count(), 2);
        assert_eq!(sink.dropped("api").len(), 2);
    }

    #[tokio::test]
    async fn test_reset_reinstates() {
        let (applier, store, _sink) = applier();
        applier.apply("api", &candidates(), &KeepSet::new()).await.unwrap();

        let static_list: BTreeSet<String> = ["m2".to_string()].into_iter().collect();
        applier.reset("api", &static_list).await.unwrap();

        assert_eq!(store.drop_list("api"), static_list);
        assert_eq!(applier.current("api").await.unwrap(), static_list);
    }
}
