use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Tunables read from `sqlbuild.toml`. Every field has a default, so an
/// empty file (or no file at all) yields the reference policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub engine: EngineSettings,
    pub readiness: ReadinessSettings,
    pub sqlcmd: SqlcmdSettings,
    pub scripts: ScriptSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSettings {
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Bytes of engine output kept on each side of the capture.
    pub output_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("/opt/mssql/bin/sqlservr"),
            args: Vec::new(),
            output_capacity: 32 << 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadinessSettings {
    pub interval_ms: u64,
    pub deadline_secs: u64,
    pub attempt_timeout_secs: u64,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            deadline_secs: 15,
            attempt_timeout_secs: 60,
        }
    }
}

impl ReadinessSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SqlcmdSettings {
    pub executable: PathBuf,
    pub host: String,
    pub user: String,
    pub login_timeout_secs: u64,
    pub query_timeout_secs: u64,
}

impl Default for SqlcmdSettings {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("/opt/mssql-tools/bin/sqlcmd"),
            host: "localhost".to_string(),
            user: "SA".to_string(),
            login_timeout_secs: 5,
            query_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScriptSettings {
    /// Line token separating batches, matched case-insensitively.
    pub separator: String,
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self {
            separator: "GO".to_string(),
        }
    }
}
