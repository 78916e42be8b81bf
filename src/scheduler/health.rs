//! Per-target scrape health.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// What a health entry tracks for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Metrics,
    Processes,
    Logs,
    Store,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceHealth {
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u64,
    pub total_failures: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthEntry {
    pub job: String,
    pub target: String,
    pub source: Source,
    #[serde(flatten)]
    pub status: SourceHealth,
}

/// Shared record of fetch and write outcomes.
#[derive(Debug, Default)]
pub struct Health {
    entries: Mutex<BTreeMap<(String, String, Source), SourceHealth>>,
}

impl Health {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, job: &str, target: &str, source: Source) {
        self.update(job, target, source, |h| {
            h.last_success = Some(Utc::now());
            h.consecutive_failures = 0;
        });
    }

    pub fn record_failure(&self, job: &str, target: &str, source: Source, error: impl Display) {
        let error = error.to_string();
        self.update(job, target, source, |h| {
            h.last_failure = Some(Utc::now());
            h.last_error = Some(error);
            h.consecutive_failures += 1;
            h.total_failures += 1;
        });
    }

    /// All entries ordered by (job, target, source).
    pub fn snapshot(&self) -> Vec<HealthEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .map(|((job, target, source), status)| HealthEntry {
                job: job.clone(),
                target: target.clone(),
                source: *source,
                status: status.clone(),
            })
            .collect()
    }

    fn update<F: FnOnce(&mut SourceHealth)>(&self, job: &str, target: &str, source: Source, f: F) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .entry((job.to_string(), target.to_string(), source))
            .or_default();
        f(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_outcomes() {
        let health = Health::new();
        health.record_failure("web", "h1", Source::Metrics, "connection refused");
        health.record_failure("web", "h1", Source::Metrics, "timed out");
        health.record_success("web", "h1", Source::Processes);

        let snapshot = health.snapshot();
        assert_eq!(snapshot.len(), 2);

        let metrics = &snapshot[0];
        assert_eq!(metrics.source, Source::Metrics);
        assert_eq!(metrics.status.consecutive_failures, 2);
        assert_eq!(metrics.status.total_failures, 2);
        assert_eq!(metrics.status.last_error.as_deref(), Some("timed out"));
        assert!(metrics.status.last_success.is_none());

        health.record_success("web", "h1", Source::Metrics);
        let metrics = &health.snapshot()[0];
        assert_eq!(metrics.status.consecutive_failures, 0);
        assert_eq!(metrics.status.total_failures, 2);
        assert!(metrics.status.last_success.is_some());
    }

    #[test]
    fn test_serializes_flat() {
        let health = Health::new();
        health.record_failure("web", "h1", Source::Store, "disk full");
        let value = serde_json::to_value(health.snapshot()).unwrap();
        assert_eq!(value[0]["job"], "web");
        assert_eq!(value[0]["source"], "store");
        assert_eq!(value[0]["last_error"], "disk full");
        assert_eq!(value[0]["consecutive_failures"], 1);
    }
}
