//! Sharded flat-file store.
//!
//! Every (kind, job, target[, app]) key maps to one JSON-lines file in a
//! single directory. Shards are tracked in an in-memory index built from
//! the directory at open time and kept current by writes and pruning, so
//! listings never have to glob the filesystem.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::value::{RawValue, Value};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use super::codec::{encode_family, encode_line, format_timestamp, parse_timestamp};
use super::models::*;
use crate::fetch::MetricFamily;

/// Store error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid shard key: {0}")]
    InvalidKey(String),
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Check that a job or target name can be used as a shard key field.
///
/// The name must survive a round trip through the shard filename, so it
/// cannot contain the key separator or path components.
pub fn validate_key_part(field: &str, value: &str) -> Result<(), StoreError> {
    if value.is_empty() {
        return Err(StoreError::InvalidKey(format!("{} must not be empty", field)));
    }
    if value.contains(KEY_SEPARATOR) {
        return Err(StoreError::InvalidKey(format!(
            "{} {:?} must not contain '{}'",
            field, value, KEY_SEPARATOR
        )));
    }
    if value.starts_with('.') || value.contains(['/', '\\', '\0']) {
        return Err(StoreError::InvalidKey(format!(
            "{} {:?} is not a valid file name component",
            field, value
        )));
    }
    Ok(())
}

fn validate_key(key: &ShardKey) -> Result<(), StoreError> {
    validate_key_part("job", &key.job)?;
    validate_key_part("target", &key.target)?;
    // App names come from remote log lines; they may contain the separator
    // (it is always the last field) but never path components.
    if key.app.contains(['/', '\\', '\0']) {
        return Err(StoreError::InvalidKey(format!(
            "app {:?} is not a valid file name component",
            key.app
        )));
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Index entry for one shard file.
#[derive(Debug)]
pub(super) struct Shard {
    /// Serializes every read, write, and rewrite of the file.
    io: Mutex<()>,
    /// False once retention has deleted the file.
    live: AtomicBool,
}

impl Shard {
    fn new(live: bool) -> Self {
        Self {
            io: Mutex::new(()),
            live: AtomicBool::new(live),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum WriteMode {
    Append,
    Overwrite,
}

/// Result of pruning one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneOutcome {
    /// The shard has no file on disk.
    Missing,
    /// Every line survived; the file was left alone.
    Unchanged { kept: usize },
    /// Some lines expired and the file was rewritten.
    Rewritten { kept: usize, dropped: usize },
    /// Nothing survived and the file was deleted.
    Removed { dropped: usize },
}

/// Thread-safe sharded store.
#[derive(Debug)]
pub struct Store {
    dir: PathBuf,
    shards: Mutex<BTreeMap<ShardKey, Arc<Shard>>>,
}

impl Store {
    /// Open the store rooted at `dir`, creating the directory if needed and
    /// indexing any shard files already present.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

        let mut shards = BTreeMap::new();
        let entries = fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let name = entry.file_name();
            let Some(key) = name.to_str().and_then(ShardKey::from_file_name) else {
                continue;
            };
            shards.insert(key, Arc::new(Shard::new(true)));
        }

        tracing::debug!("Indexed {} shards in {}", shards.len(), dir.display());

        Ok(Self {
            dir,
            shards: Mutex::new(shards),
        })
    }

    /// Root directory of the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file backing `key`.
    pub fn path_for(&self, key: &ShardKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// Keys of every shard of `kind` that currently has a file.
    pub fn keys(&self, kind: Kind) -> Vec<ShardKey> {
        lock(&self.shards)
            .iter()
            .filter(|(key, shard)| key.kind == kind && shard.live.load(Ordering::Acquire))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Get the index entry for `key`, registering it if this is the first
    /// time the key is seen.
    fn shard(&self, key: &ShardKey) -> Arc<Shard> {
        lock(&self.shards)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Shard::new(false)))
            .clone()
    }

    pub(super) fn existing_shard(&self, key: &ShardKey) -> Option<Arc<Shard>> {
        lock(&self.shards).get(key).cloned()
    }

    // --- Writes ---

    /// Append one metric snapshot for (job, target), stamped now.
    pub fn append_metric_snapshot(
        &self,
        job: &str,
        target: &str,
        families: &BTreeMap<String, MetricFamily>,
    ) -> Result<(), StoreError> {
        self.write_metric_snapshot(job, target, families, None)
    }

    fn write_metric_snapshot(
        &self,
        job: &str,
        target: &str,
        families: &BTreeMap<String, MetricFamily>,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut metrics = BTreeMap::new();
        for (name, family) in families {
            match encode_family(family) {
                Ok(encoded) => {
                    metrics.insert(name.clone(), encoded);
                }
                Err(e) => tracing::warn!("Skipping metric family {}: {}", name, e),
            }
        }

        self.write_record(
            &ShardKey::metrics(job, target),
            WriteMode::Append,
            at,
            |timestamp| MetricSnapshot { timestamp, metrics },
        )
    }

    /// Replace the process snapshot for (job, target) with `raw`.
    ///
    /// `raw` must be valid JSON; the previous snapshot is discarded.
    pub fn overwrite_process_snapshot(
        &self,
        job: &str,
        target: &str,
        raw: &[u8],
    ) -> Result<(), StoreError> {
        self.write_process_snapshot(job, target, raw, None)
    }

    fn write_process_snapshot(
        &self,
        job: &str,
        target: &str,
        raw: &[u8],
        at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        // Re-encode so a pretty-printed body still fits on one line.
        let value: Value = serde_json::from_slice(raw)?;
        let data = RawValue::from_string(serde_json::to_string(&value)?)?;

        self.write_record(
            &ShardKey::processes(job, target),
            WriteMode::Overwrite,
            at,
            |timestamp| ProcessSnapshot { timestamp, data },
        )
    }

    /// Append a raw log line, routed to its app shard by the `[app] ` prefix.
    pub fn append_log_line(&self, job: &str, target: &str, raw_line: &str) -> Result<(), StoreError> {
        self.write_log_line(job, target, raw_line, None)
    }

    fn write_log_line(
        &self,
        job: &str,
        target: &str,
        raw_line: &str,
        at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let (app, line) = split_app_prefix(raw_line);

        self.write_record(
            &ShardKey::logs(job, target, app),
            WriteMode::Append,
            at,
            |timestamp| LogRecord {
                timestamp,
                app: app.to_string(),
                line: line.to_string(),
            },
        )
    }

    // Writes stamped with a caller-chosen time, for building fixtures.

    #[cfg(test)]
    pub(crate) fn append_metric_snapshot_at(
        &self,
        job: &str,
        target: &str,
        families: &BTreeMap<String, MetricFamily>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.write_metric_snapshot(job, target, families, Some(at))
    }

    #[cfg(test)]
    pub(crate) fn overwrite_process_snapshot_at(
        &self,
        job: &str,
        target: &str,
        raw: &[u8],
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.write_process_snapshot(job, target, raw, Some(at))
    }

    #[cfg(test)]
    pub(crate) fn append_log_line_at(
        &self,
        job: &str,
        target: &str,
        raw_line: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.write_log_line(job, target, raw_line, Some(at))
    }

    /// Write one record to the shard for `key`.
    ///
    /// The timestamp is taken while holding the shard lock so lines within a
    /// shard are in timestamp order.
    fn write_record<T, F>(
        &self,
        key: &ShardKey,
        mode: WriteMode,
        at: Option<DateTime<Utc>>,
        build: F,
    ) -> Result<(), StoreError>
    where
        T: Serialize,
        F: FnOnce(String) -> T,
    {
        validate_key(key)?;

        let shard = self.shard(key);
        let _io = lock(&shard.io);

        let timestamp = format_timestamp(at.unwrap_or_else(Utc::now));
        let line = encode_line(&build(timestamp))?;

        let path = self.path_for(key);
        let mut options = OpenOptions::new();
        options.create(true);
        match mode {
            WriteMode::Append => options.append(true),
            WriteMode::Overwrite => options.write(true).truncate(true),
        };

        let mut file = options.open(&path).map_err(|e| StoreError::io(&path, e))?;
        file.write_all(&line).map_err(|e| StoreError::io(&path, e))?;
        shard.live.store(true, Ordering::Release);

        Ok(())
    }

    // --- Reads ---

    /// Run `read` against the shard file for `key` while holding its lock.
    ///
    /// A shard that was never written, or whose file is gone, reads as
    /// `T::default()`.
    pub(super) fn read_shard<T, F>(&self, key: &ShardKey, read: F) -> Result<T, StoreError>
    where
        T: Default,
        F: FnOnce(BufReader<File>) -> io::Result<T>,
    {
        let Some(shard) = self.existing_shard(key) else {
            return Ok(T::default());
        };
        let _io = lock(&shard.io);

        let path = self.path_for(key);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        read(BufReader::new(file)).map_err(|e| StoreError::io(&path, e))
    }

    // --- Retention ---

    /// Drop every line of the shard at or before `cutoff`, deleting the file
    /// if nothing newer remains. Lines without a readable timestamp are
    /// dropped as well.
    pub fn prune_shard(&self, key: &ShardKey, cutoff: DateTime<Utc>) -> Result<PruneOutcome, StoreError> {
        let Some(shard) = self.existing_shard(key) else {
            return Ok(PruneOutcome::Missing);
        };
        let _io = lock(&shard.io);

        let path = self.path_for(key);
        let data = match fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                shard.live.store(false, Ordering::Release);
                return Ok(PruneOutcome::Missing);
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        let mut kept: Vec<&[u8]> = Vec::new();
        let mut dropped = 0;
        for line in data.split(|&b| b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match parse_timestamp(line) {
                Some(ts) if ts > cutoff => kept.push(line),
                _ => dropped += 1,
            }
        }

        if kept.is_empty() {
            fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
            shard.live.store(false, Ordering::Release);
            return Ok(PruneOutcome::Removed { dropped });
        }
        if dropped == 0 {
            return Ok(PruneOutcome::Unchanged { kept: kept.len() });
        }

        let mut contents = Vec::with_capacity(data.len());
        for line in &kept {
            contents.extend_from_slice(line);
            contents.push(b'\n');
        }

        let tmp = path.with_extension("jsonl.tmp");
        fs::write(&tmp, &contents).map_err(|e| StoreError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| StoreError::io(&path, e))?;

        Ok(PruneOutcome::Rewritten {
            kept: kept.len(),
            dropped,
        })
    }
}
