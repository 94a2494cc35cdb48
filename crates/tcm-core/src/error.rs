//! Error handling for tcm
//!
//! The variants mirror how the control loop reacts to a failure. Query and
//! apply failures are local to one job and retried on the next tick with
//! fresh data; unsatisfiable budgets and configuration inconsistencies stand
//! until the configuration changes.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// The metrics backend could not answer a query for a job
    #[error("Query failure: {0}")]
    QueryFailure(String),

    /// Writing a drop decision to the configuration store failed
    #[error("Apply failure: {0}")]
    ApplyFailure(String),

    #[error("Budget unsatisfiable for job {job}: {protected_series} protected series against a budget of {budget}")]
    BudgetUnsatisfiable {
        job: String,
        protected_series: u64,
        budget: u64,
    },

    /// A budgeted job name has no matching scrape job
    #[error("No scrape job named {0}")]
    ConfigInconsistency(String),

    #[error("Configuration store error: {0}")]
    Store(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Config source error: {0}")]
    Config(#[from] config::ConfigError),

    /// Any error with context attached, rendered with its whole chain
    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    pub fn query(msg: impl Into<String>) -> Self {
        Self::QueryFailure(msg.into())
    }

    pub fn apply(msg: impl Into<String>) -> Self {
        Self::ApplyFailure(msg.into())
    }

    pub fn inconsistency(job: impl Into<String>) -> Self {
        Self::ConfigInconsistency(job.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Whether the next tick retries the work with fresh data
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::QueryFailure(_)
                | Error::ApplyFailure(_)
                | Error::Store(_)
                | Error::Timeout(_)
                | Error::Io(_)
        )
    }

    /// Whether only a configuration change clears the condition
    pub fn requires_config_change(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfiguration(_)
                | Error::BudgetUnsatisfiable { .. }
                | Error::ConfigInconsistency(_)
                | Error::Config(_)
        )
    }

    /// Stable label for logs and metrics
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidConfiguration(_) => "configuration",
            Error::QueryFailure(_) => "query",
            Error::ApplyFailure(_) => "apply",
            Error::BudgetUnsatisfiable { .. } => "budget_unsatisfiable",
            Error::ConfigInconsistency(_) => "config_inconsistency",
            Error::Store(_) => "store",
            Error::Timeout(_) => "timeout",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Config(_) => "config",
            Error::Other(_) => "other",
        }
    }
}

/// Attach context to any result whose error converts into [`Error`]
///
/// The original error is kept as the source of the returned
/// [`Error::Other`].
pub trait ErrorContext<T> {
    fn with_context(self, context: impl Into<String>) -> Result<T>;

    fn with_context_fn<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn with_context(self, context: impl Into<String>) -> Result<T> {
        self.with_context_fn(|| context.into())
    }

    fn with_context_fn<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| Error::Other(anyhow::Error::new(e.into()).context(f())))
    }
}
