//! Process listing through the PM2 process manager.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;

/// Process manager invocation errors.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} exited with {status}; stderr={stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("failed to parse process list ({bytes} bytes): {message}")]
    Parse { bytes: usize, message: String },
}

pub type ListFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<ProcessInfo>, CommandError>> + Send + 'a>>;

/// Source of the current process list.
pub trait ProcessLister: Send + Sync {
    fn list(&self) -> ListFuture<'_>;
}

/// Lists processes by running `pm2 jlist`.
#[derive(Debug, Clone)]
pub struct Pm2Cli {
    program: String,
}

impl Default for Pm2Cli {
    fn default() -> Self {
        Self {
            program: "pm2".to_string(),
        }
    }
}

impl Pm2Cli {
    /// Use a different executable in place of `pm2`.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn jlist(&self) -> Result<Vec<ProcessInfo>, CommandError> {
        let output = Command::new(&self.program)
            .arg("jlist")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| CommandError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(CommandError::Failed {
                program: self.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_process_list(&output.stdout)
    }
}

impl ProcessLister for Pm2Cli {
    fn list(&self) -> ListFuture<'_> {
        Box::pin(self.jlist())
    }
}

/// Parse the JSON array printed by `pm2 jlist`.
pub fn parse_process_list(stdout: &[u8]) -> Result<Vec<ProcessInfo>, CommandError> {
    serde_json::from_slice(stdout).map_err(|e| CommandError::Parse {
        bytes: stdout.len(),
        message: e.to_string(),
    })
}

/// One managed process.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProcessInfo {
    pub name: String,
    pub pm_id: i64,
    pub pid: i64,
    pub status: String,
    pub monit: Monit,
    pub pm2_env: Pm2Env,
    pub created_at: i64,
    pub restart_time: i64,
    pub pm_uptime: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Monit {
    pub cpu: f64,
    pub memory: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Pm2Env {
    pub exec_args: Vec<String>,
    pub cwd: String,
    pub env: EnvMap,
}

/// A process environment.
///
/// PM2 sometimes reports the environment as a string, or as a string that was
/// serialized character by character into an object with numeric keys. The
/// first becomes `{"RAW_ENV": s}`, the second an empty map.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(transparent)]
pub struct EnvMap(pub BTreeMap<String, Value>);

impl<'de> Deserialize<'de> for EnvMap {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let env = match Value::deserialize(deserializer)? {
            Value::Object(map) => {
                let numeric = map.keys().filter(|k| k.parse::<i64>().is_ok()).count();
                if numeric > map.len() / 2 {
                    BTreeMap::new()
                } else {
                    map.into_iter().collect()
                }
            }
            Value::String(raw) => BTreeMap::from([("RAW_ENV".to_string(), Value::String(raw))]),
            _ => BTreeMap::new(),
        };
        Ok(EnvMap(env))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const JLIST: &str = r#"[
        {
            "name": "api",
            "pm_id": 0,
            "pid": 4242,
            "status": "online",
            "monit": {"cpu": 1.5, "memory": 52428800},
            "pm2_env": {
                "exec_args": ["--port", "3000"],
                "cwd": "/srv/api",
                "env": {"NODE_ENV": "production", "PORT": 3000}
            },
            "created_at": 1700000000000,
            "restart_time": 2,
            "pm_uptime": 1700000100000,
            "unknown_field": true
        },
        {"name": "worker", "pm2_env": {"env": "A=1 B=2"}},
        {"name": "broken", "pm2_env": {"env": {"0": "A", "1": "=", "2": "1"}}},
        {"name": "odd", "pm2_env": {"env": 7}}
    ]"#;

    #[test]
    fn test_parse_process_list() {
        let procs = parse_process_list(JLIST.as_bytes()).unwrap();
        assert_eq!(procs.len(), 4);

        let api = &procs[0];
        assert_eq!(api.name, "api");
        assert_eq!(api.pid, 4242);
        assert_eq!(api.status, "online");
        assert_eq!(api.monit.cpu, 1.5);
        assert_eq!(api.monit.memory, 52428800.0);
        assert_eq!(api.pm2_env.exec_args, vec!["--port", "3000"]);
        assert_eq!(api.pm2_env.cwd, "/srv/api");
        assert_eq!(api.pm2_env.env.0["NODE_ENV"], json!("production"));
        assert_eq!(api.pm2_env.env.0["PORT"], json!(3000));
        assert_eq!(api.restart_time, 2);

        let worker = &procs[1];
        assert_eq!(worker.pid, 0);
        assert_eq!(worker.pm2_env.env.0["RAW_ENV"], json!("A=1 B=2"));

        assert!(procs[2].pm2_env.env.0.is_empty());
        assert!(procs[3].pm2_env.env.0.is_empty());
    }

    #[test]
    fn test_env_map_keeps_mostly_named_keys() {
        let env: EnvMap = serde_json::from_value(json!({"0": "x", "HOME": "/root", "PATH": "/bin"})).unwrap();
        assert_eq!(env.0.len(), 3);

        let env: EnvMap = serde_json::from_value(json!({"0": "x", "1": "y", "HOME": "/root"})).unwrap();
        assert!(env.0.is_empty());
    }

    #[test]
    fn test_parse_rejects_non_array() {
        let err = parse_process_list(b"[PM2] Spawning daemon").unwrap_err();
        assert!(matches!(err, CommandError::Parse { bytes: 21, .. }));

        let err = parse_process_list(br#"{"name": "api"}"#).unwrap_err();
        assert!(matches!(err, CommandError::Parse { .. }));
    }

    #[test]
    fn test_serializes_env_as_object() {
        let info = ProcessInfo {
            name: "api".to_string(),
            pm2_env: Pm2Env {
                env: EnvMap(BTreeMap::from([("A".to_string(), json!("1"))])),
                ..Default::default()
            },
            ..Default::default()
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["pm2_env"]["env"], json!({"A": "1"}));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let cli = Pm2Cli::with_program("/nonexistent/contrail-pm2");
        let err = cli.list().await.unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_program() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();

        let ok = dir.path().join("pm2-ok");
        std::fs::write(&ok, "#!/bin/sh\necho '[{\"name\":\"api\",\"pid\":7}]'\n").unwrap();
        std::fs::set_permissions(&ok, std::fs::Permissions::from_mode(0o755)).unwrap();
        let procs = Pm2Cli::with_program(ok.to_string_lossy()).list().await.unwrap();
        assert_eq!(procs.len(), 1);
        assert_eq!(procs[0].pid, 7);

        let failing = dir.path().join("pm2-fail");
        std::fs::write(&failing, "#!/bin/sh\necho 'daemon not running' >&2\nexit 3\n").unwrap();
        std::fs::set_permissions(&failing, std::fs::Permissions::from_mode(0o755)).unwrap();
        let err = Pm2Cli::with_program(failing.to_string_lossy())
            .list()
            .await
            .unwrap_err();
        match err {
            CommandError::Failed { stderr, .. } => assert_eq!(stderr, "daemon not running"),
            other => panic!("unexpected error: {}", other),
        }
    }
}
