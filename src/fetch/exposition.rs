//! Parser for the Prometheus text exposition format.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

use super::FetchError;

/// Metric family type as declared by a `# TYPE` line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Summary,
    #[default]
    Untyped,
}

impl MetricType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "counter" => Some(Self::Counter),
            "gauge" => Some(Self::Gauge),
            "histogram" => Some(Self::Histogram),
            "summary" => Some(Self::Summary),
            "untyped" => Some(Self::Untyped),
            _ => None,
        }
    }
}

/// One sample line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Full sample name, including any `_bucket`/`_sum`/`_count` suffix.
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(with = "sample_value")]
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<i64>,
}

/// Samples sharing a family name, with the family's HELP and TYPE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricFamily {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: MetricType,
    #[serde(default)]
    pub samples: Vec<Sample>,
}

impl MetricFamily {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            help: None,
            kind: MetricType::Untyped,
            samples: Vec::new(),
        }
    }
}

/// Parse an exposition payload into families keyed by name.
pub fn parse_exposition(text: &str) -> Result<BTreeMap<String, MetricFamily>, FetchError> {
    let mut families: BTreeMap<String, MetricFamily> = BTreeMap::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        let result = match line.strip_prefix('#') {
            Some(comment) => parse_comment(comment, &mut families),
            None => parse_sample(line).map(|sample| {
                let family = family_for(&sample.name, &families);
                families
                    .entry(family.clone())
                    .or_insert_with(|| MetricFamily::new(&family))
                    .samples
                    .push(sample);
            }),
        };

        result.map_err(|msg| FetchError::Decode(format!("line {}: {}", idx + 1, msg)))?;
    }

    Ok(families)
}

/// Handle `# HELP` and `# TYPE`; any other comment is ignored.
fn parse_comment(comment: &str, families: &mut BTreeMap<String, MetricFamily>) -> Result<(), String> {
    let Some((keyword, rest)) = comment.trim_start().split_once(char::is_whitespace) else {
        return Ok(());
    };
    let rest = rest.trim_start();

    match keyword {
        "HELP" => {
            let (name, help) = rest
                .split_once(char::is_whitespace)
                .map(|(name, help)| (name, help.trim_start()))
                .unwrap_or((rest, ""));
            check_metric_name(name)?;
            families
                .entry(name.to_string())
                .or_insert_with(|| MetricFamily::new(name))
                .help = Some(unescape_help(help));
        }
        "TYPE" => {
            let mut fields = rest.split_whitespace();
            let name = fields.next().ok_or("TYPE without metric name")?;
            check_metric_name(name)?;
            let kind = fields
                .next()
                .and_then(MetricType::parse)
                .ok_or_else(|| format!("invalid type for {}", name))?;
            families
                .entry(name.to_string())
                .or_insert_with(|| MetricFamily::new(name))
                .kind = kind;
        }
        _ => {}
    }
    Ok(())
}

/// Family a sample belongs to: histogram and summary samples carry a
/// suffix on the declared family name.
fn family_for(sample: &str, families: &BTreeMap<String, MetricFamily>) -> String {
    for suffix in ["_bucket", "_sum", "_count"] {
        let Some(base) = sample.strip_suffix(suffix) else {
            continue;
        };
        let Some(family) = families.get(base) else {
            continue;
        };
        let matches = match family.kind {
            MetricType::Histogram => true,
            MetricType::Summary => suffix != "_bucket",
            _ => false,
        };
        if matches {
            return base.to_string();
        }
    }
    sample.to_string()
}

fn parse_sample(line: &str) -> Result<Sample, String> {
    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .ok_or("sample without value")?;
    let name = &line[..name_end];
    check_metric_name(name)?;

    let mut rest = &line[name_end..];
    let mut labels = BTreeMap::new();
    if let Some(label_set) = rest.strip_prefix('{') {
        let (parsed, after) = parse_labels(label_set)?;
        labels = parsed;
        rest = after;
    }

    let mut fields = rest.split_whitespace();
    let value = fields.next().ok_or("sample without value")?;
    let value = parse_value(value).ok_or_else(|| format!("invalid value {:?}", value))?;
    let timestamp_ms = match fields.next() {
        Some(ts) => Some(
            ts.parse::<i64>()
                .map_err(|_| format!("invalid timestamp {:?}", ts))?,
        ),
        None => None,
    };
    if fields.next().is_some() {
        return Err("unexpected trailing data".to_string());
    }

    Ok(Sample {
        name: name.to_string(),
        labels,
        value,
        timestamp_ms,
    })
}

/// Parse `name="value",...}` and return the labels and the remainder after
/// the closing brace.
fn parse_labels(input: &str) -> Result<(BTreeMap<String, String>, &str), String> {
    let mut labels = BTreeMap::new();
    let mut rest = input;

    loop {
        rest = rest.trim_start();
        if let Some(after) = rest.strip_prefix('}') {
            return Ok((labels, after));
        }

        let eq = rest.find('=').ok_or("unterminated label set")?;
        let name = rest[..eq].trim();
        check_label_name(name)?;

        let quoted = rest[eq + 1..]
            .trim_start()
            .strip_prefix('"')
            .ok_or_else(|| format!("value of label {} is not quoted", name))?;
        let (value, after) = parse_quoted(quoted)?;
        labels.insert(name.to_string(), value);

        rest = after.trim_start();
        if let Some(after) = rest.strip_prefix(',') {
            rest = after;
        } else if !rest.starts_with('}') {
            return Err("expected ',' or '}' in label set".to_string());
        }
    }
}

/// Read a label value up to its closing quote, resolving escapes.
fn parse_quoted(input: &str) -> Result<(String, &str), String> {
    let mut value = String::new();
    let mut chars = input.char_indices();

    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((value, &input[i + 1..])),
            '\\' => match chars.next() {
                Some((_, 'n')) => value.push('\n'),
                Some((_, '"')) => value.push('"'),
                Some((_, '\\')) => value.push('\\'),
                Some((_, other)) => {
                    value.push('\\');
                    value.push(other);
                }
                None => break,
            },
            _ => value.push(c),
        }
    }
    Err("unterminated label value".to_string())
}

fn unescape_help(help: &str) -> String {
    let mut out = String::with_capacity(help.len());
    let mut chars = help.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn check_metric_name(name: &str) -> Result<(), String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*$").unwrap());
    if re.is_match(name) {
        Ok(())
    } else {
        Err(format!("invalid metric name {:?}", name))
    }
}

fn check_label_name(name: &str) -> Result<(), String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").unwrap());
    if re.is_match(name) {
        Ok(())
    } else {
        Err(format!("invalid label name {:?}", name))
    }
}

fn parse_value(s: &str) -> Option<f64> {
    match s {
        "+Inf" | "Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        _ => s.parse().ok(),
    }
}

fn format_value(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v == f64::INFINITY {
        "+Inf".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        v.to_string()
    }
}

/// Sample values are stored as strings so NaN and infinities survive JSON.
mod sample_value {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_value(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_value(&s).ok_or_else(|| D::Error::custom(format!("invalid sample value {:?}", s)))
    }
}
