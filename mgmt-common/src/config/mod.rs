//! Harness configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `MGMT_*` environment variables. Every value that did not come from the
//! defaults is recorded in [`LoadedConfig::sources`] so `mgmt-e2e config`
//! can show where it came from.

pub mod env;
pub mod source;
pub mod validate;

pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, ConfigValueSource, Sourced};
pub use validate::{ConfigWarning, Severity, validate_config};

use crate::errors::MgmtError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Serde adapter for humantime duration strings ("10s", "25m").
pub mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub general: GeneralSettings,
    pub polling: PollSettings,
    pub retry: RetryPolicy,
    pub backup: BackupSettings,
    pub cluster: ClusterSettings,
    pub suspend: SuspendSettings,
    pub simulator: SimulatorSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    pub log_level: String,
    /// Emit JSON log lines instead of the human format.
    pub log_json: bool,
    /// Directory for scenario reports; none disables writing them.
    pub report_dir: Option<PathBuf>,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
            report_dir: None,
        }
    }
}

/// Waiting parameters handed to pollers and task handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    /// Fetch interval.
    #[serde(with = "duration_str")]
    pub step: Duration,
    /// Transport failures tolerated in a row before a wait gives up.
    pub max_consecutive_failures: u32,
    /// Bound for backup and restore tasks to reach a final status.
    #[serde(with = "duration_str")]
    pub task_timeout: Duration,
    /// Bound for repair tasks.
    #[serde(with = "duration_str")]
    pub repair_timeout: Duration,
    /// Bound for progress thresholds and intermediate statuses.
    #[serde(with = "duration_str")]
    pub status_timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            step: Duration::from_secs(10),
            max_consecutive_failures: 5,
            task_timeout: Duration::from_secs(1500),
            repair_timeout: Duration::from_secs(3600),
            status_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// Locations as `<provider>:<bucket>`.
    pub locations: Vec<String>,
    pub keyspaces: Vec<String>,
    pub retention: u32,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            locations: vec!["s3:manager-backup-tests-us-east-1".to_string()],
            keyspaces: vec!["keyspace1".to_string()],
            retention: 3,
        }
    }
}

/// One database node reachable over SSH.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSettings {
    pub host: String,
    #[serde(default = "default_datacenter")]
    pub datacenter: String,
}

fn default_datacenter() -> String {
    "dc1".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    pub name: String,
    pub nodes: Vec<NodeSettings>,
    pub ssh_user: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub auth_token: Option<String>,
    /// Re-register even when a cluster with the same name exists.
    pub force_re_add: bool,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            name: "mgmt-e2e-cluster".to_string(),
            nodes: (1..=3)
                .map(|i| NodeSettings {
                    host: format!("10.0.0.{i}"),
                    datacenter: default_datacenter(),
                })
                .collect(),
            ssh_user: None,
            identity_file: None,
            auth_token: None,
            force_re_add: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuspendSettings {
    /// Bound for all running tasks to reach STOPPED after a suspend.
    #[serde(with = "duration_str")]
    pub stop_timeout: Duration,
    /// Suspension length used by the timed scenarios.
    #[serde(with = "duration_str")]
    pub window: Duration,
    /// Slack added after a window elapses before checking its effect.
    #[serde(with = "duration_str")]
    pub slack: Duration,
}

impl Default for SuspendSettings {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(60),
            window: Duration::from_secs(60),
            slack: Duration::from_secs(5),
        }
    }
}

/// Timing of the in-process control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorSettings {
    #[serde(with = "duration_str")]
    pub start_delay: Duration,
    #[serde(with = "duration_str")]
    pub stop_latency: Duration,
    #[serde(with = "duration_str")]
    pub backup_duration: Duration,
    #[serde(with = "duration_str")]
    pub restore_duration: Duration,
    /// Repair duration per keyspace at intensity 1 and parallel 0.
    #[serde(with = "duration_str")]
    pub repair_duration: Duration,
    #[serde(with = "duration_str")]
    pub healthcheck_interval: Duration,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            start_delay: Duration::from_secs(2),
            stop_latency: Duration::from_secs(4),
            backup_duration: Duration::from_secs(300),
            restore_duration: Duration::from_secs(240),
            repair_duration: Duration::from_secs(200),
            healthcheck_interval: Duration::from_secs(15),
        }
    }
}

/// Effective configuration plus the origin of every non-default value.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: HarnessConfig,
    pub sources: Vec<ConfigValueSource>,
    pub path: Option<PathBuf>,
    /// Environment variables that failed to parse.
    pub env_errors: Vec<EnvError>,
}

impl HarnessConfig {
    /// Default path: `<config dir>/mgmt-harness/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("mgmt-harness").join("config.toml"))
    }

    /// Parse a TOML document.
    pub fn from_toml(raw: &str) -> Result<Self, MgmtError> {
        toml::from_str(raw).map_err(|e| MgmtError::Config(format!("invalid TOML: {e}")))
    }

    pub fn from_file(path: &Path) -> Result<Self, MgmtError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| MgmtError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&raw)
    }

    /// Load defaults, then the file, then the environment.
    ///
    /// An explicit path must exist; the default path is optional.
    pub fn load(explicit: Option<&Path>) -> Result<LoadedConfig, MgmtError> {
        let mut sources = Vec::new();
        let path = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path().filter(|p| p.is_file()),
        };

        let mut config = match &path {
            Some(p) => {
                debug!(path = %p.display(), "loading config file");
                let config = Self::from_file(p)?;
                sources.push(ConfigValueSource::file("*", p));
                config
            }
            None => Self::default(),
        };

        let mut parser = EnvParser::new();
        config.apply_env(&mut parser, &mut sources);

        Ok(LoadedConfig {
            config,
            sources,
            path,
            env_errors: parser.take_errors(),
        })
    }

    /// Apply `MGMT_*` overrides.
    pub fn apply_env(&mut self, parser: &mut EnvParser, sources: &mut Vec<ConfigValueSource>) {
        fn take<T>(target: &mut T, value: Sourced<T>, key: &str, sources: &mut Vec<ConfigValueSource>) {
            if let Some(var) = value.env_var.as_deref() {
                sources.push(ConfigValueSource::env(key, var));
                *target = value.value;
            }
        }

        let v = parser.get_log_level("LOG_LEVEL", &self.general.log_level);
        take(&mut self.general.log_level, v, "general.log_level", sources);
        let v = parser.get_bool("LOG_JSON", self.general.log_json);
        take(&mut self.general.log_json, v, "general.log_json", sources);
        let v = parser.get_optional_path("REPORT_DIR");
        if v.is_from_env() {
            take(&mut self.general.report_dir, v, "general.report_dir", sources);
        }

        let v = parser.get_duration("POLL_STEP", self.polling.step);
        take(&mut self.polling.step, v, "polling.step", sources);
        let v = parser.get_u32_range("POLL_MAX_FAILURES", self.polling.max_consecutive_failures, 1, 100);
        take(&mut self.polling.max_consecutive_failures, v, "polling.max_consecutive_failures", sources);
        let v = parser.get_duration("TASK_TIMEOUT", self.polling.task_timeout);
        take(&mut self.polling.task_timeout, v, "polling.task_timeout", sources);
        let v = parser.get_duration("REPAIR_TIMEOUT", self.polling.repair_timeout);
        take(&mut self.polling.repair_timeout, v, "polling.repair_timeout", sources);

        let v = parser.get_u32_range("RETRY_ATTEMPTS", self.retry.max_attempts, 1, 50);
        take(&mut self.retry.max_attempts, v, "retry.max_attempts", sources);
        let v = parser.get_duration("RETRY_DELAY", self.retry.base_delay);
        take(&mut self.retry.base_delay, v, "retry.base_delay", sources);

        let v = parser.get_string_list("BACKUP_LOCATIONS", self.backup.locations.clone());
        take(&mut self.backup.locations, v, "backup.locations", sources);
        let v = parser.get_string_list("BACKUP_KEYSPACES", self.backup.keyspaces.clone());
        take(&mut self.backup.keyspaces, v, "backup.keyspaces", sources);

        let v = parser.get_string("CLUSTER_NAME", &self.cluster.name);
        take(&mut self.cluster.name, v, "cluster.name", sources);
        let v = parser.get_optional_string("SSH_USER");
        if v.is_from_env() {
            take(&mut self.cluster.ssh_user, v, "cluster.ssh_user", sources);
        }
        let v = parser.get_optional_path("SSH_IDENTITY");
        if v.is_from_env() {
            take(&mut self.cluster.identity_file, v, "cluster.identity_file", sources);
        }
        let v = parser.get_optional_string("AUTH_TOKEN");
        if v.is_from_env() {
            take(&mut self.cluster.auth_token, v, "cluster.auth_token", sources);
        }
        let v = parser.get_bool("FORCE_RE_ADD", self.cluster.force_re_add);
        take(&mut self.cluster.force_re_add, v, "cluster.force_re_add", sources);

        let v = parser.get_duration("SUSPEND_STOP_TIMEOUT", self.suspend.stop_timeout);
        take(&mut self.suspend.stop_timeout, v, "suspend.stop_timeout", sources);
        let v = parser.get_duration("SUSPEND_WINDOW", self.suspend.window);
        take(&mut self.suspend.window, v, "suspend.window", sources);
    }

    /// Copy with the auth token masked, for display.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.cluster.auth_token.is_some() {
            copy.cluster.auth_token = Some("***".to_string());
        }
        copy
    }

    /// Render as TOML, with the auth token redacted.
    pub fn to_redacted_toml(&self) -> Result<String, MgmtError> {
        toml::to_string_pretty(&self.redacted()).map_err(|e| MgmtError::Config(format!("cannot render config: {e}")))
    }
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
