//! Configuration module for contrail.
//!
//! Loads the scrape, storage, and API settings from a YAML file, then applies
//! environment overrides.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::db::validate_key_part;

/// Config file path used when `CONTRAIL_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scrape: ScrapeConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScrapeConfig {
    pub jobs: Vec<ScrapeJob>,
}

/// A named group of targets scraped on a shared interval.
#[derive(Debug, Clone, Deserialize)]
pub struct ScrapeJob {
    pub job_name: String,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub paths: Paths,
    #[serde(default = "default_interval", deserialize_with = "deserialize_duration")]
    pub interval: Duration,
    /// Timeout for the one-shot metrics and process fetches.
    #[serde(default = "default_timeout", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
}

impl ScrapeJob {
    pub fn metrics_url(&self, target: &Target) -> String {
        target.url(&self.paths.metrics)
    }

    pub fn processes_url(&self, target: &Target) -> String {
        target.url(&self.paths.processes)
    }

    pub fn logs_url(&self, target: &Target) -> String {
        target.url(&self.paths.logs)
    }
}

/// One remote agent. The host doubles as the storage key.
#[derive(Debug, Clone, Deserialize)]
pub struct Target {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub basic_auth: Option<BasicAuth>,
}

impl Target {
    fn url(&self, path: &str) -> String {
        let slash = if path.starts_with('/') { "" } else { "/" };
        if self.host.contains(':') {
            format!("http://[{}]:{}{}{}", self.host, self.port, slash, path)
        } else {
            format!("http://{}:{}{}{}", self.host, self.port, slash, path)
        }
    }
}

/// HTTP basic credentials. An empty username disables auth.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    pub fn is_enabled(&self) -> bool {
        !self.username.is_empty()
    }
}

/// Endpoint paths on each target.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Paths {
    pub metrics: String,
    pub processes: String,
    pub logs: String,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            metrics: "/metrics".to_string(),
            processes: "/processes".to_string(),
            logs: "/logs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub directory: PathBuf,
    /// Days of history to keep. Zero disables the retention sweeper.
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("data"),
            retention_days: 7,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen: String,
    pub basic_auth: Option<BasicAuth>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            basic_auth: None,
        }
    }
}

fn default_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Config {
    /// Load configuration from the file named by `CONTRAIL_CONFIG`.
    ///
    /// Environment variables:
    /// - `CONTRAIL_CONFIG`: config file path (default: "config.yaml")
    /// - `CONTRAIL_LISTEN`: overrides `api.listen`
    /// - `CONTRAIL_DATA_DIR`: overrides `storage.directory`
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var("CONTRAIL_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg = Self::from_file(&path)?;
        cfg.apply_env(|name| env::var(name).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(listen) = lookup("CONTRAIL_LISTEN") {
            self.api.listen = listen;
        }
        if let Some(dir) = lookup("CONTRAIL_DATA_DIR") {
            self.storage.directory = PathBuf::from(dir);
        }
    }

    /// Check the settings the rest of the process relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.api
            .listen
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid(format!("api.listen {:?}: {}", self.api.listen, e)))?;

        let mut job_names = HashSet::new();
        for job in &self.scrape.jobs {
            validate_key_part("job_name", &job.job_name)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            if !job_names.insert(job.job_name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate job_name {:?}",
                    job.job_name
                )));
            }
            if job.interval.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "job {}: interval must be greater than zero",
                    job.job_name
                )));
            }
            if job.timeout.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "job {}: timeout must be greater than zero",
                    job.job_name
                )));
            }

            let mut hosts = HashSet::new();
            for target in &job.targets {
                validate_key_part("target host", &target.host)
                    .map_err(|e| ConfigError::Invalid(format!("job {}: {}", job.job_name, e)))?;
                if !hosts.insert(target.host.as_str()) {
                    tracing::warn!(
                        "Job {}: targets share host {}; their data will be stored together",
                        job.job_name,
                        target.host
                    );
                }
            }
        }
        Ok(())
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom),
        Raw::Text(text) => parse_duration(&text).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid duration {:?}", text))
        }),
    }
}

/// Parse a duration such as "500ms", "15s", "1m30s", "2h", or bare seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).ok();
    }

    let mut total = 0.0;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return None;
        }
        let num: f64 = rest[..num_len].parse().ok()?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        total += match &rest[..unit_len] {
            "ns" => num / 1e9,
            "us" | "µs" => num / 1e6,
            "ms" => num / 1e3,
            "s" => num,
            "m" => num * 60.0,
            "h" => num * 3600.0,
            _ => return None,
        };
        rest = &rest[unit_len..];
    }

    Duration::try_from_secs_f64(total).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
scrape:
  jobs:
    - job_name: web
      interval: 30s
      paths:
        logs: /stream
      targets:
        - host: 10.0.0.5
          port: 9100
          basic_auth:
            username: u
            password: p
        - host: "::1"
          port: 9101
    - job_name: batch
      interval: 5
      timeout: 1500ms
      targets:
        - host: worker1
          port: 80
storage:
  directory: /var/lib/contrail
  retention_days: 0
api:
  listen: 127.0.0.1:9000
  basic_auth:
    username: admin
    password: secret
"#;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert!(cfg.scrape.jobs.is_empty());
        assert_eq!(cfg.storage.directory, PathBuf::from("data"));
        assert_eq!(cfg.storage.retention_days, 7);
        assert_eq!(cfg.api.listen, "0.0.0.0:8080");
        assert!(cfg.api.basic_auth.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_sample() {
        let cfg = Config::from_yaml(SAMPLE).unwrap();
        cfg.validate().unwrap();

        let web = &cfg.scrape.jobs[0];
        assert_eq!(web.job_name, "web");
        assert_eq!(web.interval, Duration::from_secs(30));
        assert_eq!(web.timeout, Duration::from_secs(10));
        assert_eq!(web.paths.metrics, "/metrics");
        assert_eq!(web.paths.logs, "/stream");
        assert_eq!(web.metrics_url(&web.targets[0]), "http://10.0.0.5:9100/metrics");
        assert_eq!(web.logs_url(&web.targets[0]), "http://10.0.0.5:9100/stream");
        assert_eq!(web.processes_url(&web.targets[1]), "http://[::1]:9101/processes");
        assert_eq!(
            web.targets[0].basic_auth,
            Some(BasicAuth {
                username: "u".to_string(),
                password: "p".to_string()
            })
        );
        assert!(web.targets[1].basic_auth.is_none());

        let batch = &cfg.scrape.jobs[1];
        assert_eq!(batch.interval, Duration::from_secs(5));
        assert_eq!(batch.timeout, Duration::from_millis(1500));

        assert_eq!(cfg.storage.directory, PathBuf::from("/var/lib/contrail"));
        assert_eq!(cfg.storage.retention_days, 0);
        assert_eq!(cfg.api.listen, "127.0.0.1:9000");
        assert!(cfg.api.basic_auth.as_ref().unwrap().is_enabled());
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = Config::from_yaml(SAMPLE).unwrap();
        cfg.apply_env(|name| match name {
            "CONTRAIL_LISTEN" => Some("0.0.0.0:7000".to_string()),
            "CONTRAIL_DATA_DIR" => Some("/tmp/contrail".to_string()),
            _ => None,
        });
        assert_eq!(cfg.api.listen, "0.0.0.0:7000");
        assert_eq!(cfg.storage.directory, PathBuf::from("/tmp/contrail"));

        let mut untouched = Config::from_yaml(SAMPLE).unwrap();
        untouched.apply_env(|_| None);
        assert_eq!(untouched.api.listen, "127.0.0.1:9000");
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, SAMPLE).unwrap();
        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.scrape.jobs.len(), 2);

        let err = Config::from_file(dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_rejects_bad_yaml() {
        let err = Config::from_yaml("scrape: [").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));

        let err = Config::from_yaml("scrape:\n  jobs:\n    - job_name: a\n      interval: soon\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    fn job_yaml(job: &str, host: &str, interval: &str) -> String {
        format!(
            "scrape:\n  jobs:\n    - job_name: '{}'\n      interval: {}\n      targets:\n        - host: '{}'\n          port: 80\n",
            job, interval, host
        )
    }

    #[test]
    fn test_validate_key_names() {
        for (job, host) in [
            ("my_job", "h"),
            ("job", "my_host"),
            ("", "h"),
            ("job", ""),
            ("a/b", "h"),
            ("job", "a\\b"),
            (".hidden", "h"),
        ] {
            let cfg = Config::from_yaml(&job_yaml(job, host, "15s")).unwrap();
            let err = cfg.validate().unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{} {}", job, host);
        }

        let cfg = Config::from_yaml(&job_yaml("web-1", "10.0.0.5", "15s")).unwrap();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_interval_and_duplicates() {
        let cfg = Config::from_yaml(&job_yaml("web", "h", "0s")).unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = Config::from_yaml(&job_yaml("web", "h", "1s")).unwrap();
        let dup = cfg.scrape.jobs[0].clone();
        cfg.scrape.jobs.push(dup);
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = Config::default();
        cfg.api.listen = "not an address".to_string();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("15s"), Some(Duration::from_secs(15)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("1m30s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration(" 3s "), Some(Duration::from_secs(3)));

        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("s"), None);
        assert_eq!(parse_duration("5 days"), None);
        assert_eq!(parse_duration("5d"), None);
        assert_eq!(parse_duration("-1"), None);
    }
}
