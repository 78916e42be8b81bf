//! Retention sweeper for pruning old records.

use crate::db::{Kind, PruneOutcome, Store};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Time between sweeps. The first sweep happens one period after start.
pub const SWEEP_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Totals for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub files_scanned: usize,
    pub files_rewritten: usize,
    pub files_removed: usize,
    pub lines_dropped: usize,
    pub errors: usize,
}

/// Periodically drops records older than the retention horizon.
#[derive(Debug, Clone)]
pub struct RetentionSweeper {
    store: Arc<Store>,
    retention: ChronoDuration,
}

impl RetentionSweeper {
    pub fn new(store: Arc<Store>, retention_days: u32) -> Self {
        Self {
            store,
            retention: ChronoDuration::days(i64::from(retention_days)),
        }
    }

    /// Start the sweeper background task.
    pub fn start(&self) -> JoinHandle<()> {
        let sweeper = self.clone();

        tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + SWEEP_PERIOD, SWEEP_PERIOD);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                interval.tick().await;

                let task = sweeper.clone();
                match tokio::task::spawn_blocking(move || task.sweep(Utc::now())).await {
                    Ok(report) => tracing::info!(
                        "Retention sweep: scanned {} files, rewrote {}, removed {}, dropped {} lines, {} errors",
                        report.files_scanned,
                        report.files_rewritten,
                        report.files_removed,
                        report.lines_dropped,
                        report.errors
                    ),
                    Err(e) => tracing::error!("Retention sweep panicked: {}", e),
                }
            }
        })
    }

    /// Prune every shard against `now - retention`.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let cutoff = now - self.retention;
        let mut report = SweepReport::default();

        for kind in Kind::ALL {
            for key in self.store.keys(kind) {
                report.files_scanned += 1;
                match self.store.prune_shard(&key, cutoff) {
                    Ok(PruneOutcome::Missing) | Ok(PruneOutcome::Unchanged { .. }) => {}
                    Ok(PruneOutcome::Rewritten { dropped, .. }) => {
                        report.files_rewritten += 1;
                        report.lines_dropped += dropped;
                    }
                    Ok(PruneOutcome::Removed { dropped }) => {
                        report.files_removed += 1;
                        report.lines_dropped += dropped;
                    }
                    Err(e) => {
                        report.errors += 1;
                        tracing::error!("Retention: failed to prune {}: {}", key.file_name(), e);
                    }
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::QueryParams;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, Arc<Store>, DateTime<Utc>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let now = Utc::now();
        (dir, store, now)
    }

    #[test]
    fn test_sweep_prunes_and_removes() {
        let (_dir, store, now) = fixture();
        let day = ChronoDuration::days(1);

        for age in [10, 8, 2, 1] {
            store
                .append_log_line_at("web", "h1", &format!("[api] {} days old", age), now - day * age)
                .unwrap();
        }
        store
            .append_log_line_at("web", "h1", "[old] gone", now - day * 30)
            .unwrap();
        store
            .overwrite_process_snapshot_at("web", "h1", b"[]", now - day)
            .unwrap();

        let sweeper = RetentionSweeper::new(store.clone(), 7);
        let report = sweeper.sweep(now);
        assert_eq!(report.files_scanned, 3);
        assert_eq!(report.files_rewritten, 1);
        assert_eq!(report.files_removed, 1);
        assert_eq!(report.lines_dropped, 3);
        assert_eq!(report.errors, 0);

        let mut q = QueryParams::new("web", "h1");
        q.app = Some("api".to_string());
        let lines: Vec<String> = store
            .query_logs_range(&q)
            .unwrap()
            .into_iter()
            .map(|r| r.line)
            .collect();
        assert_eq!(lines, vec!["2 days old", "1 days old"]);

        q.app = Some("old".to_string());
        assert!(store.query_logs_range(&q).unwrap().is_empty());
        assert_eq!(store.query_processes(&QueryParams::new("web", "h1")).unwrap().len(), 1);
    }

    #[test]
    fn test_sweep_is_idempotent() {
        let (_dir, store, now) = fixture();
        let day = ChronoDuration::days(1);
        for age in [9, 5, 3, 0] {
            store
                .append_log_line_at("web", "h1", &format!("line {}", age), now - day * age)
                .unwrap();
        }

        let sweeper = RetentionSweeper::new(store.clone(), 4);
        let q = QueryParams::new("web", "h1");

        let first = sweeper.sweep(now);
        assert_eq!(first.lines_dropped, 2);
        let after_first = store.query_logs_range(&q).unwrap();

        let second = sweeper.sweep(now);
        assert_eq!(second.lines_dropped, 0);
        assert_eq!(second.files_rewritten, 0);
        assert_eq!(store.query_logs_range(&q).unwrap(), after_first);
    }

    #[test]
    fn test_removed_shard_accepts_new_writes() {
        let (_dir, store, now) = fixture();
        store
            .append_log_line_at("web", "h1", "stale", now - ChronoDuration::days(3))
            .unwrap();

        let sweeper = RetentionSweeper::new(store.clone(), 1);
        assert_eq!(sweeper.sweep(now).files_removed, 1);
        assert!(store.list_targets().is_empty());

        store.append_log_line_at("web", "h1", "fresh", now).unwrap();
        assert_eq!(store.list_targets().into_iter().collect::<Vec<_>>(), vec!["h1"]);
        assert_eq!(sweeper.sweep(now).files_removed, 0);
    }
}
