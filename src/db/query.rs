//! Read-side queries over the shard store.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::value::RawValue;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::io::{self, BufRead, Seek, SeekFrom};

use super::codec::{decode_family, parse_timestamp};
use super::models::*;
use super::store::{Store, StoreError};

/// Upper bound on the tail buffer preallocation; larger requests still work,
/// the buffer just grows as lines arrive.
const TAIL_PREALLOC: usize = 4096;

impl Store {
    /// Raw records of a metrics or processes shard within the query's time
    /// range, in file order. Lines without a readable timestamp are skipped.
    pub fn query_range(&self, kind: Kind, q: &QueryParams) -> Result<Vec<Box<RawValue>>, StoreError> {
        let key = match kind {
            Kind::Metrics => ShardKey::metrics(&q.job, &q.target),
            Kind::Processes => ShardKey::processes(&q.job, &q.target),
            Kind::Logs => ShardKey::logs(&q.job, &q.target, q.app.as_deref().unwrap_or_default()),
        };

        self.read_shard(&key, |reader| {
            let mut records = Vec::new();
            for line in reader.split(b'\n') {
                let line = line?;
                match parse_timestamp(&line) {
                    Some(ts) if q.contains(ts) => {}
                    _ => continue,
                }
                if let Some(raw) = raw_record(line) {
                    records.push(raw);
                }
            }
            Ok(records)
        })
    }

    pub fn query_metrics(&self, q: &QueryParams) -> Result<Vec<Box<RawValue>>, StoreError> {
        self.query_range(Kind::Metrics, q)
    }

    pub fn query_processes(&self, q: &QueryParams) -> Result<Vec<Box<RawValue>>, StoreError> {
        self.query_range(Kind::Processes, q)
    }

    /// Like [`Store::query_metrics`], with each metric family decoded.
    /// Families that fail to decode are left out of their snapshot.
    pub fn query_metrics_decoded(&self, q: &QueryParams) -> Result<Vec<DecodedMetricSnapshot>, StoreError> {
        let mut decoded = Vec::new();
        for raw in self.query_metrics(q)? {
            let Ok(snapshot) = serde_json::from_str::<MetricSnapshot>(raw.get()) else {
                continue;
            };

            let mut metrics = std::collections::BTreeMap::new();
            for (name, encoded) in snapshot.metrics {
                match decode_family(&encoded) {
                    Ok(family) => {
                        metrics.insert(name, family);
                    }
                    Err(e) => tracing::debug!("Skipping undecodable family {}: {}", name, e),
                }
            }

            decoded.push(DecodedMetricSnapshot {
                timestamp: snapshot.timestamp,
                metrics,
            });
        }
        Ok(decoded)
    }

    /// Process names from every process snapshot in the time range, one per
    /// process entry. With [`NameListing::Distinct`] only the first
    /// occurrence of each name is kept.
    pub fn query_app_names(&self, q: &QueryParams, listing: NameListing) -> Result<Vec<AppName>, StoreError> {
        #[derive(Deserialize)]
        struct Entries {
            #[serde(default)]
            data: Vec<AppName>,
        }

        let key = ShardKey::processes(&q.job, &q.target);
        let names: Vec<AppName> = self.read_shard(&key, |reader| {
            let mut names = Vec::new();
            for line in reader.split(b'\n') {
                let line = line?;
                match parse_timestamp(&line) {
                    Some(ts) if q.contains(ts) => {}
                    _ => continue,
                }
                if let Ok(entries) = serde_json::from_slice::<Entries>(&line) {
                    names.extend(entries.data);
                }
            }
            Ok(names)
        })?;

        Ok(match listing {
            NameListing::All => names,
            NameListing::Distinct => {
                let mut seen = HashSet::new();
                names.into_iter().filter(|n| seen.insert(n.name.clone())).collect()
            }
        })
    }

    /// Log records in the time range.
    ///
    /// With no app set, each app shard of the target is read to completion
    /// in filename order; records are not merged across shards.
    pub fn query_logs_range(&self, q: &QueryParams) -> Result<Vec<LogRecord>, StoreError> {
        let mut records = Vec::new();
        for key in self.log_shards(&q.job, &q.target, q.app.as_deref()) {
            let mut shard_records =
                self.read_shard(&key, |mut reader| scan_log_range(&mut reader, q.start, q.end))?;
            records.append(&mut shard_records);
        }
        Ok(records)
    }

    /// The last `q.num_lines` log records across the matching shards, oldest
    /// first. Shards are visited in filename order, so with no app set the
    /// result only approximates chronological order.
    pub fn tail_logs(&self, q: &QueryParams) -> Result<Vec<LogRecord>, StoreError> {
        let n = match usize::try_from(q.num_lines) {
            Ok(n) if n > 0 => n,
            _ => return Ok(Vec::new()),
        };

        let mut window: VecDeque<Vec<u8>> = VecDeque::with_capacity(n.min(TAIL_PREALLOC));
        for key in self.log_shards(&q.job, &q.target, q.app.as_deref()) {
            self.read_shard(&key, |reader| {
                for line in reader.split(b'\n') {
                    let line = line?;
                    if window.len() == n {
                        window.pop_front();
                    }
                    window.push_back(line);
                }
                Ok(())
            })?;
        }

        Ok(window
            .iter()
            .filter_map(|line| serde_json::from_slice(line).ok())
            .collect())
    }

    /// Every target that has at least one log shard.
    pub fn list_targets(&self) -> BTreeSet<String> {
        self.keys(Kind::Logs).into_iter().map(|k| k.target).collect()
    }

    /// Every job with a log shard for `target`.
    pub fn list_jobs(&self, target: &str) -> BTreeSet<String> {
        self.keys(Kind::Logs)
            .into_iter()
            .filter(|k| k.target == target)
            .map(|k| k.job)
            .collect()
    }

    /// Log shards to read for (job, target[, app]), sorted by filename.
    fn log_shards(&self, job: &str, target: &str, app: Option<&str>) -> Vec<ShardKey> {
        if let Some(app) = app {
            return vec![ShardKey::logs(job, target, app)];
        }

        let mut keys: Vec<ShardKey> = self
            .keys(Kind::Logs)
            .into_iter()
            .filter(|k| k.job == job && k.target == target)
            .collect();
        keys.sort_by_cached_key(ShardKey::file_name);
        keys
    }
}

fn raw_record(line: Vec<u8>) -> Option<Box<RawValue>> {
    let text = String::from_utf8(line).ok()?;
    RawValue::from_string(text).ok()
}

/// Scan one log shard for records in `[start, end]`.
///
/// Lines are in timestamp order within a shard, so the scan seeks straight
/// to the first line at or after `start` and stops at the first line past
/// `end`.
fn scan_log_range<R: BufRead + Seek>(
    reader: &mut R,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> io::Result<Vec<LogRecord>> {
    let offset = match start {
        Some(start) => seek_first_at_or_after(reader, start)?,
        None => 0,
    };
    reader.seek(SeekFrom::Start(offset))?;

    let mut records = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        let Some(ts) = parse_timestamp(trim_newline(&line)) else {
            continue;
        };
        if start.is_some_and(|start| ts < start) {
            continue;
        }
        if end.is_some_and(|end| ts > end) {
            break;
        }
        if let Ok(record) = serde_json::from_slice(trim_newline(&line)) {
            records.push(record);
        }
    }
    Ok(records)
}

/// Binary search over byte offsets for the start of the first line whose
/// timestamp is at or after `start`. Returns the file length if there is
/// none.
///
/// Unreadable lines carry no ordering information; a probe that lands on
/// one reads forward to the next readable line.
fn seek_first_at_or_after<R: BufRead + Seek>(reader: &mut R, start: DateTime<Utc>) -> io::Result<u64> {
    let len = reader.seek(SeekFrom::End(0))?;
    let mut lo = 0;
    let mut hi = len;
    let mut buf = Vec::new();

    // Invariant: every readable line starting before `lo` is older than
    // `start`, and the line starting at `hi` (if any) is not.
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let line_start = next_line_start(reader, mid, &mut buf)?;
        if line_start >= hi {
            hi = mid;
            continue;
        }

        let mut pos = line_start;
        let mut probe = None;
        while pos < hi {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 {
                break;
            }
            pos += n as u64;
            if let Some(ts) = parse_timestamp(trim_newline(&buf)) {
                probe = Some(ts);
                break;
            }
        }

        match probe {
            Some(ts) if ts < start => lo = pos,
            Some(_) => hi = line_start,
            None => hi = mid,
        }
    }
    Ok(lo)
}

/// Offset of the first line starting at or after `pos`, leaving the reader
/// positioned there.
fn next_line_start<R: BufRead + Seek>(reader: &mut R, pos: u64, buf: &mut Vec<u8>) -> io::Result<u64> {
    if pos == 0 {
        reader.seek(SeekFrom::Start(0))?;
        return Ok(0);
    }
    reader.seek(SeekFrom::Start(pos - 1))?;
    buf.clear();
    let n = reader.read_until(b'\n', buf)?;
    Ok(pos - 1 + n as u64)
}

fn trim_newline(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\n").unwrap_or(line)
}
