use std::{collections::BTreeMap, path::PathBuf};

use chrono::{DateTime, Utc};

mod identity;

pub use identity::{Identity, IdentityError, LOGS_CATEGORY, TOPICS_CATEGORY, escape_segment};

/// How a supervised process is judged healthy.
///
/// Persisted alongside the process record, so a restarted supervisor can keep
/// probing processes spawned by an earlier run.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HealthCheckSpec {
    /// Request `url` with `method`; healthy on `200 OK`.
    Http { method: String, url: String },
    /// Connect to the process's assigned port on loopback.
    Tcp {
        #[serde(default)]
        ipv4: bool,
    },
    /// The PID still answers a liveness signal.
    Process,
}

impl HealthCheckSpec {
    pub fn http_get(url: impl Into<String>) -> Self {
        Self::Http {
            method: "GET".to_string(),
            url: url.into(),
        }
    }
}

/// Everything needed to start a supervised process.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessConfig {
    pub id: Identity,
    /// Defaults to the supervisor's current directory.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    /// Overlaid on top of the supervisor's own environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
}

impl ProcessConfig {
    pub fn new(id: Identity, command: impl Into<String>) -> Self {
        Self {
            id,
            command: command.into(),
            ..Default::default()
        }
    }
}

/// A process the supervisor has started. Immutable once stored; a record
/// existing says nothing about whether the OS process is still alive.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub id: Identity,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub work_dir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub command: String,
    pub args: Vec<String>,
    pub port: u16,
    pub health_check: Option<HealthCheckSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Running,
    Exited,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatus {
    #[serde(flatten)]
    pub process: ProcessRecord,
    pub state: ProcessState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_check_spec_is_tagged() {
        let http = HealthCheckSpec::http_get("http://localhost:1/api/health");
        assert_eq!(
            serde_json::to_value(&http).unwrap(),
            serde_json::json!({"type": "http", "method": "GET", "url": "http://localhost:1/api/health"})
        );

        let tcp: HealthCheckSpec = serde_json::from_str(r#"{"type":"tcp","ipv4":true}"#).unwrap();
        assert_eq!(tcp, HealthCheckSpec::Tcp { ipv4: true });

        let pid: HealthCheckSpec = serde_json::from_str(r#"{"type":"process"}"#).unwrap();
        assert_eq!(pid, HealthCheckSpec::Process);
    }

    #[test]
    fn record_survives_json() {
        let record = ProcessRecord {
            id: Identity::from_parts(["app", "todo"], "daemon"),
            pid: 42,
            started_at: Utc::now(),
            work_dir: PathBuf::from("/tmp"),
            env: BTreeMap::from([("PORT".to_string(), "3000".to_string())]),
            command: "node".into(),
            args: vec!["daemon.js".into()],
            port: 3000,
            health_check: Some(HealthCheckSpec::Tcp { ipv4: false }),
        };
        let text = serde_json::to_string(&record).unwrap();
        let back: ProcessRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back, record);
    }
}
