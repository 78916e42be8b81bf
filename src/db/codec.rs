//! Line codec shared by every shard: one JSON object per line, each with a
//! leading RFC3339 `timestamp` field.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

use super::StoreError;
use crate::fetch::MetricFamily;

/// Format a timestamp as RFC3339 UTC with nanosecond precision.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Decode only the `timestamp` field of a JSON line.
///
/// Returns `None` if the line is not a JSON object or the timestamp is
/// missing or malformed.
pub fn parse_timestamp(line: &[u8]) -> Option<DateTime<Utc>> {
    #[derive(Deserialize)]
    struct Head<'a> {
        #[serde(borrow)]
        timestamp: Cow<'a, str>,
    }

    let head: Head = serde_json::from_slice(line).ok()?;
    DateTime::parse_from_rfc3339(&head.timestamp)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Serialize a record as a single newline-terminated JSON line.
pub fn encode_line<T: Serialize>(record: &T) -> Result<Vec<u8>, StoreError> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    Ok(line)
}

/// Encode a metric family for storage in a metric snapshot.
pub fn encode_family(family: &MetricFamily) -> Result<String, StoreError> {
    Ok(STANDARD.encode(serde_json::to_vec(family)?))
}

/// Inverse of [`encode_family`].
pub fn decode_family(encoded: &str) -> Result<MetricFamily, StoreError> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| StoreError::Decode(format!("invalid base64: {}", e)))?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Decode(e.to_string()))
}
