use std::sync::{Arc, Mutex, PoisonError};

use indexmap::IndexMap;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DisparityError {
    #[error("disparity requires at least two observed groups")]
    InsufficientGroups,
}

/// Per-group request tallies. Latencies are recorded for successes only, so
/// `latencies_seconds.len() == succeeded` at all times.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroupMetrics {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub latencies_seconds: Vec<f64>,
}

impl GroupMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.attempted == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.attempted as f64 * 100.0
    }

    pub fn mean_latency(&self) -> f64 {
        if self.latencies_seconds.is_empty() {
            return 0.0;
        }
        self.latencies_seconds.iter().sum::<f64>() / self.latencies_seconds.len() as f64
    }
}

/// Shared tally of request outcomes, bucketed by caller-supplied group label.
///
/// Handles are cheap clones of one underlying map; a single lock guards the
/// whole mapping. Instantiate one per test case rather than reaching for a
/// process-wide instance.
#[derive(Debug, Clone, Default)]
pub struct OutcomeAggregator {
    groups: Arc<Mutex<IndexMap<String, GroupMetrics>>>,
}

impl OutcomeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&self, group: &str) {
        let mut groups = self.lock();
        groups.entry(group.to_string()).or_default().attempted += 1;
    }

    pub fn record_success(&self, group: &str, latency_seconds: f64) {
        let mut groups = self.lock();
        let metrics = groups.entry(group.to_string()).or_default();
        metrics.succeeded += 1;
        metrics.latencies_seconds.push(latency_seconds);
    }

    pub fn record_failure(&self, group: &str) {
        let mut groups = self.lock();
        groups.entry(group.to_string()).or_default().failed += 1;
    }

    /// Percentage of attempts that succeeded; `0` for a group never observed.
    pub fn success_rate(&self, group: &str) -> f64 {
        self.lock()
            .get(group)
            .map(GroupMetrics::success_rate)
            .unwrap_or(0.0)
    }

    /// Arithmetic mean of recorded latencies; `0` when none were recorded.
    pub fn mean_latency(&self, group: &str) -> f64 {
        self.lock()
            .get(group)
            .map(GroupMetrics::mean_latency)
            .unwrap_or(0.0)
    }

    /// Max minus min of `metric` across every observed group.
    pub fn disparity<F>(&self, metric: F) -> Result<f64, DisparityError>
    where
        F: Fn(&GroupMetrics) -> f64,
    {
        let groups = self.lock();
        if groups.len() < 2 {
            return Err(DisparityError::InsufficientGroups);
        }
        let mut lowest = f64::MAX;
        let mut highest = f64::MIN;
        for metrics in groups.values() {
            let value = metric(metrics);
            lowest = lowest.min(value);
            highest = highest.max(value);
        }
        Ok(highest - lowest)
    }

    pub fn group_names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> IndexMap<String, GroupMetrics> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IndexMap<String, GroupMetrics>> {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
