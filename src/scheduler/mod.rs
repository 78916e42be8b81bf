//! Scheduler module for running scrape jobs.
//!
//! Every job gets one poll loop that fetches metrics and process snapshots
//! from each of its targets on the job interval, and every target gets one
//! log tail loop that reconnects for as long as the process runs.

mod health;
mod retention;

pub use health::*;
pub use retention::*;

use crate::config::{ScrapeJob, Target};
use crate::db::{Store, StoreError};
use crate::fetch::{FetchError, TargetFetcher};

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Delay before reconnecting a log tail that failed.
pub const TAIL_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Spawns the scrape loops for a set of jobs.
pub struct Scheduler {
    store: Arc<Store>,
    health: Arc<Health>,
    tail_backoff: Duration,
}

impl Scheduler {
    pub fn new(store: Arc<Store>, health: Arc<Health>) -> Self {
        Self {
            store,
            health,
            tail_backoff: TAIL_RETRY_BACKOFF,
        }
    }

    /// Override the delay used after a failed log tail.
    pub fn with_tail_backoff(mut self, backoff: Duration) -> Self {
        self.tail_backoff = backoff;
        self
    }

    /// Spawn the poll and tail loops for `jobs`.
    ///
    /// The loops never return; the handles are only useful for aborting them.
    pub fn start(&self, jobs: &[ScrapeJob]) -> Result<Vec<JoinHandle<()>>, FetchError> {
        let targets: usize = jobs.iter().map(|j| j.targets.len()).sum();
        tracing::info!("Starting scheduler with {} jobs and {} targets", jobs.len(), targets);

        let mut handles = Vec::with_capacity(jobs.len() + targets);
        for job in jobs {
            let ctx = JobContext {
                job: Arc::new(job.clone()),
                fetcher: TargetFetcher::new(job.timeout)?,
                store: self.store.clone(),
                health: self.health.clone(),
            };

            for target in &job.targets {
                handles.push(tokio::spawn(run_tail_loop(
                    ctx.clone(),
                    target.clone(),
                    self.tail_backoff,
                )));
            }
            handles.push(tokio::spawn(run_poll_loop(ctx)));
        }

        Ok(handles)
    }
}

#[derive(Clone)]
struct JobContext {
    job: Arc<ScrapeJob>,
    fetcher: TargetFetcher,
    store: Arc<Store>,
    health: Arc<Health>,
}

impl JobContext {
    fn name(&self) -> &str {
        &self.job.job_name
    }

    fn record_fetch<T>(&self, target: &Target, source: Source, result: &Result<T, FetchError>) {
        match result {
            Ok(_) => self.health.record_success(self.name(), &target.host, source),
            Err(e) => {
                tracing::warn!(
                    "Job {}: {:?} fetch from {} failed: {}",
                    self.name(),
                    source,
                    target.host,
                    e
                );
                self.health.record_failure(self.name(), &target.host, source, e);
            }
        }
    }

    fn record_write(&self, target: &Target, result: Result<(), StoreError>) {
        match result {
            Ok(()) => self.health.record_success(self.name(), &target.host, Source::Store),
            Err(e) => {
                tracing::error!(
                    "Job {}: dropped write for {}: {}",
                    self.name(),
                    target.host,
                    e
                );
                self.health.record_failure(self.name(), &target.host, Source::Store, e);
            }
        }
    }
}

/// Tick on the job interval, starting immediately, and scrape every target
/// in its own task so a slow target never holds up the others.
async fn run_poll_loop(ctx: JobContext) {
    let mut interval = tokio::time::interval(ctx.job.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;

        for target in &ctx.job.targets {
            let ctx = ctx.clone();
            let target = target.clone();
            tokio::spawn(async move {
                // Add jitter to avoid thundering herd
                let jitter = rand::random::<u64>() % 100;
                tokio::time::sleep(Duration::from_millis(jitter)).await;

                scrape_target(&ctx, &target).await;
            });
        }
    }
}

/// Fetch metrics and processes for one target. Each is attempted even if
/// the other fails.
async fn scrape_target(ctx: &JobContext, target: &Target) {
    let metrics = ctx
        .fetcher
        .fetch_metrics(&ctx.job.metrics_url(target), target.basic_auth.as_ref())
        .await;
    ctx.record_fetch(target, Source::Metrics, &metrics);
    if let Ok(families) = metrics {
        let written = ctx.store.append_metric_snapshot(ctx.name(), &target.host, &families);
        ctx.record_write(target, written);
    }

    let processes = ctx
        .fetcher
        .fetch_process_snapshot(&ctx.job.processes_url(target))
        .await;
    ctx.record_fetch(target, Source::Processes, &processes);
    if let Ok(body) = processes {
        let written = ctx.store.overwrite_process_snapshot(ctx.name(), &target.host, &body);
        ctx.record_write(target, written);
    }
}

/// Stream a target's logs into the store forever. A clean close reconnects
/// at once; an error waits `backoff` first.
async fn run_tail_loop(ctx: JobContext, target: Target, backoff: Duration) {
    let url = ctx.job.logs_url(&target);

    loop {
        tracing::debug!("Job {}: tailing logs from {}", ctx.name(), url);

        let mut received = false;
        let result = ctx
            .fetcher
            .tail_log(&url, target.basic_auth.as_ref(), |line| {
                if !received {
                    received = true;
                    ctx.health.record_success(ctx.name(), &target.host, Source::Logs);
                }
                let written = ctx.store.append_log_line(ctx.name(), &target.host, line);
                ctx.record_write(&target, written);
            })
            .await;

        match result {
            Ok(()) => {
                tracing::info!(
                    "Job {}: log stream from {} closed, reconnecting",
                    ctx.name(),
                    target.host
                );
            }
            Err(e) => {
                tracing::warn!(
                    "Job {}: log stream from {} failed: {}; retrying in {:?}",
                    ctx.name(),
                    target.host,
                    e,
                    backoff
                );
                ctx.health.record_failure(ctx.name(), &target.host, Source::Logs, e);
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
