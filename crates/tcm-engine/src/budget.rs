//! Budget evaluation

use std::collections::BTreeMap;
use tcm_core::Config;
use tracing::warn;

/// Compares series counts against immutable budgets
///
/// Jobs without a per-job budget are exempt from per-job enforcement but
/// still count toward the global budget.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BudgetEvaluator {
    jobs: BTreeMap<String, u64>,
    global: Option<u64>,
}

impl BudgetEvaluator {
    pub fn new(jobs: BTreeMap<String, u64>, global: Option<u64>) -> Self {
        Self { jobs, global }
    }

    /// Build from configuration, ignoring budgets for unknown jobs
    ///
    /// Returns the ignored job names so they can be surfaced as
    /// configuration inconsistencies.
    pub fn from_config(config: &Config) -> (Self, Vec<String>) {
        let unmatched = config.unmatched_budgets();
        for job in &unmatched {
            warn!(job = %job, "Budget configured for unknown scrape job, ignoring");
        }

        let jobs = config
            .budgets
            .jobs
            .iter()
            .filter(|(name, _)| !unmatched.contains(name))
            .map(|(name, budget)| (name.clone(), *budget))
            .collect();

        (Self::new(jobs, config.budgets.global), unmatched)
    }

    pub fn budget_for(&self, job: &str) -> Option<u64> {
        self.jobs.get(job).copied()
    }

    pub fn global_budget(&self) -> Option<u64> {
        self.global
    }

    pub fn is_over_budget(&self, job: &str, total_series: u64) -> bool {
        self.deficit(job, total_series) > 0
    }

    /// Series that must be removed to reach the job budget, never negative
    pub fn deficit(&self, job: &str, total_series: u64) -> u64 {
        self.budget_for(job)
            .map(|budget| total_series.saturating_sub(budget))
            .unwrap_or(0)
    }

    pub fn is_over_global(&self, total_series: u64) -> bool {
        self.global_deficit(total_series) > 0
    }

    pub fn global_deficit(&self, total_series: u64) -> u64 {
        self.global
            .map(|budget| total_series.saturating_sub(budget))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tcm_core::ScrapeJobConfig;

    fn evaluator() -> BudgetEvaluator {
        BudgetEvaluator::new([("api".to_string(), 1000)].into_iter().collect(), Some(5000))
    }

    #[test]
    fn test_deficit() {
        let budgets = evaluator();
        assert_eq!(budgets.deficit("api", 1500), 500);
        assert_eq!(budgets.deficit("api", 1000), 0);
        assert_eq!(budgets.deficit("api", 10), 0);

        assert!(budgets.is_over_budget("api", 1001));
        assert!(!budgets.is_over_budget("api", 1000));
    }

    #[test]
    fn test_unbudgeted_job_is_exempt() {
        let budgets = evaluator();
        assert_eq!(budgets.budget_for("beta"), None);
        assert_eq!(budgets.deficit("beta", 1_000_000), 0);
        assert!(!budgets.is_over_budget("beta", 1_000_000));
    }

    #[test]
    fn test_global_budget() {
        let budgets = evaluator();
        assert!(budgets.is_over_global(6000));
        assert_eq!(budgets.global_deficit(6000), 1000);
        assert!(!budgets.is_over_global(5000));

        let unbounded = BudgetEvaluator::default();
        assert!(!unbounded.is_over_global(u64::MAX));
    }

    #[test]
    fn test_from_config_ignores_unknown_jobs() {
        let mut config = Config {
            scrape_jobs: vec![ScrapeJobConfig::new("api")],
            ..Default::default()
        };
        config.budgets.jobs.insert("api".to_string(), 1000);
        config.budgets.jobs.insert("ghost".to_string(), 10);

        let (budgets, unmatched) = BudgetEvaluator::from_config(&config);
        assert_eq!(unmatched, vec!["ghost".to_string()]);
        assert_eq!(budgets.budget_for("api"), Some(1000));
        assert_eq!(budgets.budget_for("ghost"), None);
    }
}
