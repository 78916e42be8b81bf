//! Record, key, and query types for the shard store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::BTreeMap;

use crate::fetch::MetricFamily;

/// The kind of data a shard holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Metrics,
    Processes,
    Logs,
}

impl Kind {
    pub const ALL: [Kind; 3] = [Kind::Metrics, Kind::Processes, Kind::Logs];

    /// Filename prefix for shards of this kind.
    pub fn prefix(self) -> &'static str {
        match self {
            Kind::Metrics => "metrics",
            Kind::Processes => "processes",
            Kind::Logs => "logs",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        Kind::ALL.into_iter().find(|k| k.prefix() == prefix)
    }
}

/// Separator between key fields in shard filenames.
pub const KEY_SEPARATOR: char = '_';

const SHARD_SUFFIX: &str = ".jsonl";

/// Identifies exactly one shard file.
///
/// `app` is only meaningful for [`Kind::Logs`] and is empty otherwise.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardKey {
    pub kind: Kind,
    pub job: String,
    pub target: String,
    pub app: String,
}

impl ShardKey {
    pub fn metrics(job: &str, target: &str) -> Self {
        Self::new(Kind::Metrics, job, target, "")
    }

    pub fn processes(job: &str, target: &str) -> Self {
        Self::new(Kind::Processes, job, target, "")
    }

    pub fn logs(job: &str, target: &str, app: &str) -> Self {
        Self::new(Kind::Logs, job, target, app)
    }

    fn new(kind: Kind, job: &str, target: &str, app: &str) -> Self {
        Self {
            kind,
            job: job.to_string(),
            target: target.to_string(),
            app: app.to_string(),
        }
    }

    /// `metrics_<job>_<target>.jsonl`, `processes_<job>_<target>.jsonl`,
    /// or `logs_<job>_<target>_<app>.jsonl`.
    pub fn file_name(&self) -> String {
        match self.kind {
            Kind::Logs => format!(
                "{}_{}_{}_{}{}",
                self.kind.prefix(),
                self.job,
                self.target,
                self.app,
                SHARD_SUFFIX
            ),
            _ => format!(
                "{}_{}_{}{}",
                self.kind.prefix(),
                self.job,
                self.target,
                SHARD_SUFFIX
            ),
        }
    }

    /// Recover a key from a shard filename. Returns `None` for files that do
    /// not follow the shard layout.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let core = name.strip_suffix(SHARD_SUFFIX)?;
        let (prefix, rest) = core.split_once(KEY_SEPARATOR)?;
        let kind = Kind::from_prefix(prefix)?;

        let mut parts = rest.splitn(3, KEY_SEPARATOR);
        let job = parts.next().filter(|s| !s.is_empty())?;
        let target = parts.next().filter(|s| !s.is_empty())?;
        let app = parts.next();

        match (kind, app) {
            (Kind::Logs, Some(app)) => Some(Self::logs(job, target, app)),
            (Kind::Metrics | Kind::Processes, None) => Some(Self::new(kind, job, target, "")),
            _ => None,
        }
    }
}

/// One poll tick's metrics for a (job, target): family name to encoded family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub timestamp: String,
    pub metrics: BTreeMap<String, String>,
}

/// A metric snapshot with its families decoded.
#[derive(Debug, Clone, Serialize)]
pub struct DecodedMetricSnapshot {
    pub timestamp: String,
    pub metrics: BTreeMap<String, MetricFamily>,
}

/// The latest process list fetched from a target, kept verbatim.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub timestamp: String,
    pub data: Box<RawValue>,
}

/// A single log line from a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: String,
    pub app: String,
    pub line: String,
}

/// Split an optional `[app] ` prefix off a raw log line.
///
/// Returns `(app, message)`; lines without the prefix get an empty app and
/// are kept verbatim.
pub fn split_app_prefix(raw: &str) -> (&str, &str) {
    if let Some(inner) = raw.strip_prefix('[') {
        if let Some(end) = inner.find(']') {
            return (&inner[..end], inner[end + 1..].trim());
        }
    }
    ("", raw)
}

/// A process name extracted from a process snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppName {
    #[serde(default)]
    pub name: String,
}

/// Whether app-name listing collapses repeated names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NameListing {
    /// One entry per process per snapshot, repeats included.
    #[default]
    All,
    /// First occurrence of each name only.
    Distinct,
}

/// Parameters shared by every read-side query. Fields a query does not use
/// are ignored.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub job: String,
    pub target: String,
    /// For log queries, `None` means every app shard of the target.
    pub app: Option<String>,
    /// Inclusive lower bound; `None` is unbounded.
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper bound; `None` is unbounded.
    pub end: Option<DateTime<Utc>>,
    pub num_lines: i64,
}

impl QueryParams {
    pub fn new(job: &str, target: &str) -> Self {
        Self {
            job: job.to_string(),
            target: target.to_string(),
            ..Default::default()
        }
    }

    /// Whether `ts` falls within `[start, end]`.
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start.map_or(true, |start| ts >= start) && self.end.map_or(true, |end| ts <= end)
    }
}
