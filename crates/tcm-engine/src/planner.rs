//! Drop planning
//!
//! Candidates are ranked by byte cost descending, then metric name ascending,
//! then job name ascending, and consumed greedily until the deficit is
//! covered. Drop granularity is one metric, so a plan may overshoot the
//! deficit, but it never extends past the shortest sufficient prefix.

use serde::Serialize;
use std::cmp::Ordering;
use tcm_core::{KeepSet, MetricCandidate};
use tracing::{debug, warn};

/// The deficit could not be covered without dropping protected metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Unsatisfiable {
    /// Series of protected candidates
    pub protected_series: u64,
    /// Series removed by dropping every unprotected candidate
    pub dropped_series: u64,
    /// Deficit left after dropping everything allowed
    pub remaining_deficit: u64,
}

/// Metrics selected for dropping in one tick
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DropPlan {
    pub job: String,
    pub deficit: u64,
    pub selected: Vec<MetricCandidate>,
    pub unsatisfiable: Option<Unsatisfiable>,
}

impl DropPlan {
    pub fn empty(job: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            deficit: 0,
            selected: Vec::new(),
            unsatisfiable: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    pub fn selected_series(&self) -> u64 {
        self.selected.iter().map(|c| c.series_count).sum()
    }

    pub fn metric_names(&self) -> Vec<&str> {
        self.selected.iter().map(|c| c.metric.as_str()).collect()
    }
}

/// Ranking order: cost descending, metric ascending, job ascending
pub fn compare(a: &MetricCandidate, b: &MetricCandidate) -> Ordering {
    b.bytes_cost
        .cmp(&a.bytes_cost)
        .then_with(|| a.metric.cmp(&b.metric))
        .then_with(|| a.job.cmp(&b.job))
}

/// Unprotected candidates in ranking order
pub fn rank(candidates: &[MetricCandidate], keep_set: &KeepSet) -> Vec<MetricCandidate> {
    let mut ranked: Vec<MetricCandidate> = candidates
        .iter()
        .filter(|c| !keep_set.contains(&c.metric))
        .cloned()
        .collect();
    ranked.sort_by(compare);
    ranked
}

/// Select the metrics to drop for `job` this tick
pub fn plan(job: &str, candidates: &[MetricCandidate], keep_set: &KeepSet, deficit: u64) -> DropPlan {
    if deficit == 0 {
        return DropPlan::empty(job);
    }

    let mut accumulated = 0u64;
    let mut selected = Vec::new();

    for candidate in rank(candidates, keep_set) {
        if accumulated >= deficit {
            break;
        }
        accumulated = accumulated.saturating_add(candidate.series_count);
        selected.push(candidate);
    }

    let unsatisfiable = if accumulated < deficit {
        let protected_series = candidates
            .iter()
            .filter(|c| keep_set.contains(&c.metric))
            .map(|c| c.series_count)
            .sum();

        warn!(
            job = %job,
            deficit,
            dropped_series = accumulated,
            protected_series,
            "Dropping every unprotected metric still leaves the job over budget"
        );

        Some(Unsatisfiable {
            protected_series,
            dropped_series: accumulated,
            remaining_deficit: deficit - accumulated,
        })
    } else {
        None
    };

    debug!(
        job = %job,
        deficit,
        selected = selected.len(),
        selected_series = accumulated,
        "Planned drops"
    );

    DropPlan {
        job: job.to_string(),
        deficit,
        selected,
        unsatisfiable,
    }
}

/// Unprotected candidates whose byte cost exceeds `ceiling`, in ranking order
pub fn over_cost_ceiling(
    candidates: &[MetricCandidate],
    keep_set: &KeepSet,
    ceiling: u64,
) -> Vec<MetricCandidate> {
    rank(candidates, keep_set)
        .into_iter()
        .filter(|c| c.bytes_cost > ceiling)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_candidates() -> Vec<MetricCandidate> {
        vec![
            MetricCandidate::new("api", "m1", 200, 900),
            MetricCandidate::new("api", "m2", 300, 500),
            MetricCandidate::new("api", "m3", 1000, 100),
        ]
    }

    #[test]
    fn test_scenario_a_greedy_prefix() {
        let plan = plan("api", &scenario_candidates(), &KeepSet::new(), 500);

        assert_eq!(plan.metric_names(), vec!["m1", "m2"]);
        assert_eq!(plan.selected_series(), 500);
        assert!(plan.unsatisfiable.is_none());
    }

    #[test]
    fn test_scenario_b_protected_metric_filtered() {
        let keep: KeepSet = ["m1"].into_iter().collect();
        let plan = plan("api", &scenario_candidates(), &keep, 500);

        assert_eq!(plan.metric_names(), vec!["m2", "m3"]);
        assert_eq!(plan.selected_series(), 1300);
        assert!(plan.unsatisfiable.is_none());
    }

    #[test]
    fn test_scenario_c_unsatisfiable() {
        // Protected metrics alone carry 2000 series against a budget of 1000
        let candidates = vec![
            MetricCandidate::new("api", "rule_input_a", 1200, 5000),
            MetricCandidate::new("api", "rule_input_b", 800, 4000),
            MetricCandidate::new("api", "noise_a", 300, 900),
            MetricCandidate::new("api", "noise_b", 100, 100),
        ];
        let keep: KeepSet = ["rule_input_a", "rule_input_b"].into_iter().collect();
        let total: u64 = candidates.iter().map(|c| c.series_count).sum();
        let deficit = total - 1000;

        let plan = plan("api", &candidates, &keep, deficit);

        assert_eq!(plan.metric_names(), vec!["noise_a", "noise_b"]);
        let unsatisfiable = plan.unsatisfiable.unwrap();
        assert_eq!(unsatisfiable.protected_series, 2000);
        assert_eq!(unsatisfiable.dropped_series, 400);
        assert_eq!(unsatisfiable.remaining_deficit, 1000);
    }

    #[test]
    fn test_never_selects_protected() {
        let candidates = scenario_candidates();
        let keep: KeepSet = ["m1", "m3"].into_iter().collect();

        for deficit in [1, 300, 301, 5000] {
            let plan = plan("api", &candidates, &keep, deficit);
            assert!(plan.selected.iter().all(|c| !keep.contains(&c.metric)));
        }
    }

    #[test]
    fn test_zero_deficit_plans_nothing() {
        let plan = plan("api", &scenario_candidates(), &KeepSet::new(), 0);
        assert!(plan.is_empty());
        assert!(plan.unsatisfiable.is_none());
    }

    #[test]
    fn test_smallest_sufficient_prefix() {
        let candidates = vec![
            MetricCandidate::new("api", "a", 50, 700),
            MetricCandidate::new("api", "b", 60, 600),
            MetricCandidate::new("api", "c", 70, 500),
            MetricCandidate::new("api", "d", 80, 400),
        ];

        for deficit in 1..=260u64 {
            let plan = plan("api", &candidates, &KeepSet::new(), deficit);
            let selected = plan.selected_series();
            assert!(selected >= deficit);

            // Dropping the last selected metric would no longer suffice
            let last = plan.selected.last().unwrap().series_count;
            assert!(selected - last < deficit);
        }
    }

    #[test]
    fn test_tie_break_by_name_is_deterministic() {
        let forward = vec![
            MetricCandidate::new("api", "zeta", 100, 500),
            MetricCandidate::new("api", "alpha", 100, 500),
            MetricCandidate::new("api", "mid", 100, 500),
        ];
        let mut reversed = forward.clone();
        reversed.reverse();

        let a = plan("api", &forward, &KeepSet::new(), 150);
        let b = plan("api", &reversed, &KeepSet::new(), 150);

        assert_eq!(a.metric_names(), vec!["alpha", "mid"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_over_cost_ceiling() {
        let keep: KeepSet = ["m1"].into_iter().collect();
        let expensive = over_cost_ceiling(&scenario_candidates(), &keep, 200);

        let names: Vec<&str> = expensive.iter().map(|c| c.metric.as_str()).collect();
        assert_eq!(names, vec!["m2"]);
    }
}
