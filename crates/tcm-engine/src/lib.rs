//! # tcm-engine
//!
//! The cardinality-control pipeline of the timeseries cardinality manager.
//!
//! This crate provides:
//! - Keep-set extraction from alerting and recording rule expressions
//! - Per-job cardinality estimation against a metrics backend
//! - Budget evaluation for per-job, global and remote-write ceilings
//! - Greedy, deterministic drop planning
//! - Idempotent application of drop decisions to a configuration store
//! - Remote-write limiting, scoped to the forwarding path only
//!
//! ## Example
//!
//! ```rust
//! use tcm_core::{KeepSet, MetricCandidate};
//! use tcm_engine::planner;
//!
//! let candidates = vec![
//!     MetricCandidate::new("api", "m1", 200, 900),
//!     MetricCandidate::new("api", "m2", 300, 500),
//!     MetricCandidate::new("api", "m3", 1000, 100),
//! ];
//!
//! let plan = planner::plan("api", &candidates, &KeepSet::new(), 500);
//! assert_eq!(plan.metric_names(), vec!["m1", "m2"]);
//! ```

use std::time::Duration;
use thiserror::Error;

pub mod applier;
pub mod budget;
pub mod estimator;
pub mod keep_set;
pub mod planner;
pub mod remote_write;
pub mod store;

// Re-export commonly used types
pub use applier::{ApplyOutcome, DropApplier};
pub use budget::BudgetEvaluator;
pub use estimator::{Estimate, Estimator};
pub use keep_set::{build_keep_set, extract_metric_names};
pub use planner::{DropPlan, Unsatisfiable};
pub use remote_write::{JobSurvivors, RemoteWriteLimiter, RemoteWriteOutcome};
pub use store::{InMemoryConfigStore, RelabelFileStore};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur while measuring or enforcing budgets
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Estimate error: {0}")]
    Estimate(String),

    #[error("Apply error: {0}")]
    Apply(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("{operation} timed out after {elapsed:?}")]
    Timeout { operation: String, elapsed: Duration },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Core error: {0}")]
    Core(#[from] tcm_core::Error),
}

impl EngineError {
    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Estimate(_) => "estimate",
            EngineError::Apply(_) => "apply",
            EngineError::Store(_) => "store",
            EngineError::Timeout { .. } => "timeout",
            EngineError::Serialization(_) => "serialization",
            EngineError::Io(_) => "io",
            EngineError::Core(e) => e.category(),
        }
    }
}

/// Run `fut` under `limit`, mapping an elapsed timer to [`EngineError::Timeout`]
pub(crate) async fn with_timeout<T, F>(operation: &str, limit: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::timeout(operation, limit)),
    }
}
