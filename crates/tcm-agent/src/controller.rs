//! The cardinality control loop
//!
//! A [`Controller`] owns an immutable configuration [`Snapshot`] behind an
//! `ArcSwap`. Each pass loads the snapshot once and runs every job through
//! estimate, evaluate, plan and apply on its own task, bounded by the worker
//! limit. A failure is local to its job. After the jobs finish the pass
//! checks the global budget and limits remote write over the jobs that
//! produced fresh data.

use crate::Result;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tcm_core::{
    Config, ConfigStore, ControlConfig, ControlEvent, DropRecord, FailureKind,
    InstrumentationSink, KeepSet, MetricCandidate, MetricsBackend, ScrapeJob, TickSource,
};
use tcm_engine::{
    build_keep_set, planner, BudgetEvaluator, DropApplier, Estimator, JobSurvivors,
    RemoteWriteLimiter, RemoteWriteOutcome,
};
use tokio::sync::{watch, Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Controller lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    /// Waiting for the next tick
    Idle,
    /// A pass is in progress
    Running,
}

/// Everything a pass reads, built once per configuration load
pub struct Snapshot {
    pub jobs: Vec<ScrapeJob>,
    pub keep_set: KeepSet,
    pub budgets: BudgetEvaluator,
    pub control: ControlConfig,
    /// Budgeted job names with no matching scrape job
    pub unmatched_budgets: Vec<String>,
    estimator: Estimator,
    applier: Arc<DropApplier>,
    remote_write: Option<Arc<RemoteWriteLimiter>>,
}

impl Snapshot {
    fn build(
        config: &Config,
        backend: &Arc<dyn MetricsBackend>,
        store: &Arc<dyn ConfigStore>,
        sink: &Arc<dyn InstrumentationSink>,
    ) -> Self {
        let control = config.control.clone();
        let keep_set = build_keep_set(&config.rules);
        let (budgets, unmatched_budgets) = BudgetEvaluator::from_config(config);

        let estimator = Estimator::new(
            backend.clone(),
            control.label_sample_size,
            control.query_timeout(),
        );
        let applier = Arc::new(DropApplier::new(
            store.clone(),
            sink.clone(),
            control.apply_timeout(),
        ));
        let remote_write = config.remote_write.clone().map(|remote_write| {
            Arc::new(RemoteWriteLimiter::new(
                remote_write,
                store.clone(),
                sink.clone(),
                control.apply_timeout(),
            ))
        });

        Self {
            jobs: config.scrape_jobs.iter().map(ScrapeJob::from).collect(),
            keep_set,
            budgets,
            control,
            unmatched_budgets,
            estimator,
            applier,
            remote_write,
        }
    }

    /// Remote-write destination, if one is configured
    pub fn remote_write_destination(&self) -> Option<&str> {
        self.remote_write.as_ref().map(|limiter| limiter.destination())
    }

    /// Static drop-list of a job with protected metrics removed
    fn static_drop_list(&self, job: &ScrapeJob) -> BTreeSet<String> {
        job.drop_list
            .iter()
            .filter(|metric| !self.keep_set.contains(metric))
            .cloned()
            .collect()
    }
}

/// One job that could not be fully processed in a pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub job: String,
    pub kind: FailureKind,
    pub error: String,
}

/// Summary of one pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassReport {
    /// Jobs evaluated and applied successfully
    pub processed: Vec<String>,
    /// Jobs without fresh data this pass
    pub skipped: Vec<String>,
    pub failed: Vec<JobFailure>,
    /// Metrics newly added to drop-lists
    pub dropped: Vec<DropRecord>,
    /// Jobs whose protected metrics alone exceed their budget
    pub unsatisfiable: Vec<String>,
    /// Series measured across all jobs with fresh data
    pub total_series: u64,
    pub global_budget_exceeded: bool,
    pub remote_write: Option<RemoteWriteOutcome>,
    pub duration_ms: u64,
}

/// Per-job result handed back from a worker task
struct JobResult {
    job: String,
    measured: Option<u64>,
    dropped: Vec<DropRecord>,
    failure: Option<JobFailure>,
    survivors: Option<JobSurvivors>,
    unsatisfiable: bool,
}

impl JobResult {
    fn failed(job: &str, kind: FailureKind, error: String) -> Self {
        Self {
            job: job.to_string(),
            measured: None,
            dropped: Vec::new(),
            failure: Some(JobFailure {
                job: job.to_string(),
                kind,
                error,
            }),
            survivors: None,
            unsatisfiable: false,
        }
    }
}

struct ControllerInner {
    snapshot: ArcSwap<Snapshot>,
    backend: Arc<dyn MetricsBackend>,
    store: Arc<dyn ConfigStore>,
    sink: Arc<dyn InstrumentationSink>,
    /// Standing unsatisfiable jobs and the budget they were raised against
    unsatisfiable: DashMap<String, u64>,
    state: RwLock<ControllerState>,
    /// Held for a whole pass or reload
    pass_lock: Mutex<()>,
}

/// Drives cardinality control passes
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl Controller {
    /// Create a controller for a validated configuration
    ///
    /// Budgets naming unknown jobs are reported as configuration
    /// inconsistencies and ignored.
    pub fn new(
        config: &Config,
        backend: Arc<dyn MetricsBackend>,
        store: Arc<dyn ConfigStore>,
        sink: Arc<dyn InstrumentationSink>,
    ) -> Result<Self> {
        config.validate()?;

        let snapshot = Snapshot::build(config, &backend, &store, &sink);
        for job in &snapshot.unmatched_budgets {
            sink.emit(&ControlEvent::ConfigInconsistency { job: job.clone() });
        }

        info!(
            jobs = snapshot.jobs.len(),
            protected = snapshot.keep_set.len(),
            remote_write = snapshot.remote_write.is_some(),
            "Controller initialized"
        );

        Ok(Self {
            inner: Arc::new(ControllerInner {
                snapshot: ArcSwap::from_pointee(snapshot),
                backend,
                store,
                sink,
                unsatisfiable: DashMap::new(),
                state: RwLock::new(ControllerState::Idle),
                pass_lock: Mutex::new(()),
            }),
        })
    }

    /// Current lifecycle state
    pub async fn state(&self) -> ControllerState {
        *self.inner.state.read().await
    }

    /// Configuration snapshot the next pass will use
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.snapshot.load_full()
    }

    async fn set_state(&self, state: ControllerState) {
        *self.inner.state.write().await = state;
    }

    /// Run passes on every tick until shutdown or the tick source runs dry
    ///
    /// Shutdown is only observed between passes; a pass in flight always
    /// completes.
    pub async fn run<T: TickSource>(&self, mut ticker: T, mut shutdown: watch::Receiver<bool>) {
        info!("Control loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("Shutdown channel closed");
                        break;
                    }
                    continue;
                }
                ticked = ticker.tick() => {
                    if !ticked {
                        info!("Tick source exhausted");
                        break;
                    }
                }
            }

            let report = self.run_pass().await;
            info!(
                processed = report.processed.len(),
                failed = report.failed.len(),
                dropped = report.dropped.len(),
                total_series = report.total_series,
                duration_ms = report.duration_ms,
                "Pass complete"
            );
        }

        info!("Control loop stopped");
    }

    /// Run one pass over every configured job
    pub async fn run_pass(&self) -> PassReport {
        let _pass = self.inner.pass_lock.lock().await;
        self.set_state(ControllerState::Running).await;
        let started = Instant::now();

        let snapshot = self.inner.snapshot.load_full();
        let permits = Arc::new(Semaphore::new(snapshot.control.effective_worker_limit()));
        let mut tasks = JoinSet::new();

        for job in snapshot.jobs.iter().cloned() {
            let inner = self.inner.clone();
            let snapshot = snapshot.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let name = job.name.clone();
                let sink = inner.sink.clone();

                // A panic inside the job still has to surface as its failure
                let work = tokio::spawn(async move { process_job(&inner, &snapshot, job).await });
                match work.await {
                    Ok(result) => result,
                    Err(e) => {
                        error!(job = %name, error = %e, "Job task died");
                        sink.emit(&ControlEvent::JobFailed {
                            job: name.clone(),
                            kind: FailureKind::Internal,
                            error: e.to_string(),
                        });
                        JobResult::failed(&name, FailureKind::Internal, e.to_string())
                    }
                }
            });
        }

        let mut results = Vec::with_capacity(snapshot.jobs.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => error!("Job task failed: {}", e),
            }
        }
        results.sort_by(|a, b| a.job.cmp(&b.job));

        let mut report = PassReport::default();
        let mut survivors = Vec::new();

        for result in results {
            if let Some(measured) = result.measured {
                report.total_series = report.total_series.saturating_add(measured);
            }
            if result.unsatisfiable {
                report.unsatisfiable.push(result.job.clone());
            }
            match result.failure {
                Some(failure) => {
                    if failure.kind == FailureKind::Query {
                        report.skipped.push(result.job.clone());
                    }
                    report.failed.push(failure);
                }
                None => report.processed.push(result.job.clone()),
            }
            report.dropped.extend(result.dropped);
            survivors.extend(result.survivors);
        }

        self.check_global_budget(&snapshot, &mut report);

        if let Some(limiter) = &snapshot.remote_write {
            match limiter.limit(&survivors, &snapshot.keep_set).await {
                Ok(outcome) => report.remote_write = Some(outcome),
                Err(e) => warn!(
                    destination = %limiter.destination(),
                    error = %e,
                    "Remote-write limiting failed, retrying next pass"
                ),
            }
        }

        let elapsed = started.elapsed();
        report.duration_ms = elapsed.as_millis() as u64;
        self.inner.sink.record_pass(elapsed);
        self.set_state(ControllerState::Idle).await;

        report
    }

    fn check_global_budget(&self, snapshot: &Snapshot, report: &mut PassReport) {
        let sink = &self.inner.sink;
        sink.set_global_series(report.total_series);

        let exceeded = snapshot.budgets.is_over_global(report.total_series);
        sink.set_global_budget_exceeded(exceeded);
        report.global_budget_exceeded = exceeded;

        if let Some(budget) = snapshot.budgets.global_budget().filter(|_| exceeded) {
            warn!(
                total_series = report.total_series,
                budget,
                "Global series budget exceeded"
            );
            sink.emit(&ControlEvent::GlobalBudgetExceeded {
                total_series: report.total_series,
                budget,
            });
        }
    }

    /// Replace the configuration snapshot
    ///
    /// Every configured job's drop-list is reset to its static drop-list
    /// minus the new keep set and the remote-write restriction is cleared.
    /// This is the only way a dropped metric comes back. Waits for any pass
    /// in flight.
    pub async fn reload(&self, config: &Config) -> Result<()> {
        config.validate()?;

        let inner = &self.inner;
        let snapshot = Arc::new(Snapshot::build(config, &inner.backend, &inner.store, &inner.sink));

        let _pass = inner.pass_lock.lock().await;
        let previous = inner.snapshot.swap(snapshot.clone());

        for job in &snapshot.jobs {
            let drop_list = snapshot.static_drop_list(job);
            if let Err(e) = snapshot.applier.reset(&job.name, &drop_list).await {
                warn!(job = %job.name, error = %e, "Failed to reset drop-list");
                inner.sink.emit(&ControlEvent::JobFailed {
                    job: job.name.clone(),
                    kind: FailureKind::Apply,
                    error: e.to_string(),
                });
            }
        }

        let mut limiters: Vec<&Arc<RemoteWriteLimiter>> = snapshot.remote_write.iter().collect();
        if let Some(old) = &previous.remote_write {
            if snapshot.remote_write_destination() != Some(old.destination()) {
                limiters.push(old);
            }
        }
        for limiter in limiters {
            if let Err(e) = limiter.clear().await {
                warn!(
                    destination = %limiter.destination(),
                    error = %e,
                    "Failed to clear remote-write restriction"
                );
            }
        }

        for job in &snapshot.unmatched_budgets {
            inner.sink.emit(&ControlEvent::ConfigInconsistency { job: job.clone() });
        }

        // A standing condition clears once its job or budget changes
        let cleared: Vec<String> = inner
            .unsatisfiable
            .iter()
            .filter(|entry| snapshot.budgets.budget_for(entry.key()) != Some(*entry.value()))
            .map(|entry| entry.key().clone())
            .collect();
        for job in cleared {
            inner.unsatisfiable.remove(&job);
            inner.sink.emit(&ControlEvent::BudgetSatisfiable { job });
        }

        info!(
            jobs = snapshot.jobs.len(),
            protected = snapshot.keep_set.len(),
            "Configuration reloaded"
        );
        Ok(())
    }
}

/// Estimate, evaluate, plan and apply for one job
async fn process_job(inner: &ControllerInner, snapshot: &Snapshot, job: ScrapeJob) -> JobResult {
    let sink = &inner.sink;
    let keep_set = &snapshot.keep_set;

    let fail = |kind: FailureKind, error: String| {
        warn!(job = %job.name, kind = %kind, error = %error, "Job failed this pass");
        sink.emit(&ControlEvent::JobFailed {
            job: job.name.clone(),
            kind,
            error: error.clone(),
        });
        JobResult::failed(&job.name, kind, error)
    };

    let persisted = match snapshot.applier.current(&job.name).await {
        Ok(drop_list) => drop_list,
        Err(e) => return fail(FailureKind::Apply, e.to_string()),
    };

    // Protected metrics never stay dropped; static drops the store has not
    // seen yet are seeded
    let (protected, mut suppressed): (BTreeSet<String>, BTreeSet<String>) =
        persisted.iter().cloned().partition(|metric| keep_set.contains(metric));
    suppressed.extend(snapshot.static_drop_list(&job));

    if suppressed != persisted {
        if !protected.is_empty() {
            info!(
                job = %job.name,
                metrics = ?protected,
                "Removing protected metrics from persisted drop-list"
            );
        }
        if let Err(e) = snapshot.applier.reset(&job.name, &suppressed).await {
            return fail(FailureKind::Apply, e.to_string());
        }
    }

    let estimate = match snapshot.estimator.estimate(&job, &suppressed).await {
        Ok(estimate) => estimate,
        Err(e) => return fail(FailureKind::Query, e.to_string()),
    };
    sink.set_job_series(&job.name, estimate.total_series);

    let over_ceiling = snapshot
        .control
        .max_metric_cost_bytes
        .map(|ceiling| planner::over_cost_ceiling(&estimate.candidates, keep_set, ceiling))
        .unwrap_or_default();
    let remaining: Vec<MetricCandidate> = estimate
        .candidates
        .iter()
        .filter(|c| !over_ceiling.iter().any(|o| o.metric == c.metric))
        .cloned()
        .collect();
    let remaining_series: u64 = remaining.iter().map(|c| c.series_count).sum();

    let deficit = snapshot.budgets.deficit(&job.name, remaining_series);
    let plan = planner::plan(&job.name, &remaining, keep_set, deficit);

    let mut selected = over_ceiling;
    selected.extend(plan.selected.iter().cloned());

    let dropped = if selected.is_empty() {
        Vec::new()
    } else {
        match snapshot.applier.apply(&job.name, &selected, keep_set).await {
            Ok(outcome) => outcome.newly_dropped,
            Err(e) => {
                let mut result = fail(FailureKind::Apply, e.to_string());
                result.measured = Some(estimate.total_series);
                return result;
            }
        }
    };

    let unsatisfiable = match (&plan.unsatisfiable, snapshot.budgets.budget_for(&job.name)) {
        (Some(shortfall), Some(budget)) => {
            if inner.unsatisfiable.insert(job.name.clone(), budget).is_none() {
                sink.emit(&ControlEvent::BudgetUnsatisfiable {
                    job: job.name.clone(),
                    protected_series: shortfall.protected_series,
                    budget,
                });
            }
            true
        }
        _ => {
            if inner.unsatisfiable.remove(&job.name).is_some() {
                info!(job = %job.name, "Job is back within reach of its budget");
                sink.emit(&ControlEvent::BudgetSatisfiable { job: job.name.clone() });
            }
            false
        }
    };

    let survivors: Vec<MetricCandidate> = remaining
        .into_iter()
        .filter(|c| !plan.selected.iter().any(|s| s.metric == c.metric))
        .collect();

    debug!(
        job = %job.name,
        total_series = estimate.total_series,
        deficit,
        dropped = dropped.len(),
        "Job processed"
    );

    JobResult {
        job: job.name.clone(),
        measured: Some(estimate.total_series),
        dropped,
        failure: None,
        survivors: Some(JobSurvivors::new(job.name.clone(), survivors)),
        unsatisfiable,
    }
}
