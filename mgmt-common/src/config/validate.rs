//! Configuration sanity checks.

use super::HarnessConfig;
use serde::Serialize;
use std::fmt;

/// Providers accepted in backup locations.
pub const LOCATION_PROVIDERS: [&str; 3] = ["s3", "gcs", "azure"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// One finding from [`validate_config`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: Severity,
}

impl ConfigWarning {
    fn warning(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
            severity: Severity::Warning,
        }
    }

    fn error(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
            severity: Severity::Error,
        }
    }
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{tag}: {}: {}", self.field, self.message)
    }
}

/// Check a `<provider>:<bucket>` location. Paths below the bucket are
/// rejected.
pub fn check_location(location: &str) -> Result<(), String> {
    let Some((provider, bucket)) = location.split_once(':') else {
        return Err(format!("'{location}' is missing the '<provider>:' prefix"));
    };
    if !LOCATION_PROVIDERS.contains(&provider) {
        return Err(format!(
            "unknown provider '{provider}' (expected one of {})",
            LOCATION_PROVIDERS.join(", ")
        ));
    }
    if bucket.is_empty() {
        return Err(format!("'{location}' has an empty bucket name"));
    }
    if bucket.contains('/') {
        return Err(format!("'{location}' must name a bucket without a path"));
    }
    Ok(())
}

/// Report problems in the effective configuration. Errors make the harness
/// refuse to run; warnings are printed.
pub fn validate_config(config: &HarnessConfig) -> Vec<ConfigWarning> {
    let mut findings = Vec::new();

    if config.polling.step.is_zero() {
        findings.push(ConfigWarning::error("polling.step", "must be greater than zero"));
    }
    if config.polling.step > config.polling.task_timeout {
        findings.push(ConfigWarning::warning(
            "polling.step",
            "is longer than polling.task_timeout; waits will fetch once",
        ));
    }
    if config.polling.max_consecutive_failures == 0 {
        findings.push(ConfigWarning::error(
            "polling.max_consecutive_failures",
            "must be at least 1",
        ));
    }

    if config.retry.max_attempts == 0 {
        findings.push(ConfigWarning::warning("retry.max_attempts", "0 is treated as 1"));
    }
    if !(0.0..=1.0).contains(&config.retry.jitter) {
        findings.push(ConfigWarning::error("retry.jitter", "must be within 0.0..=1.0"));
    }

    if config.backup.locations.is_empty() {
        findings.push(ConfigWarning::error("backup.locations", "at least one location is required"));
    }
    for location in &config.backup.locations {
        if let Err(reason) = check_location(location) {
            findings.push(ConfigWarning::error("backup.locations", reason));
        }
    }
    if config.backup.retention == 0 {
        findings.push(ConfigWarning::warning("backup.retention", "0 purges every previous snapshot"));
    }

    if config.cluster.name.trim().is_empty() {
        findings.push(ConfigWarning::error("cluster.name", "must not be empty"));
    }
    if config.cluster.nodes.is_empty() {
        findings.push(ConfigWarning::error("cluster.nodes", "at least one node is required"));
    }
    if let Some(identity) = &config.cluster.identity_file
        && !identity.exists()
    {
        findings.push(ConfigWarning::warning(
            "cluster.identity_file",
            format!("{} does not exist", identity.display()),
        ));
    }

    if config.suspend.slack.is_zero() {
        findings.push(ConfigWarning::warning(
            "suspend.slack",
            "zero slack makes auto-resume checks race the scheduler",
        ));
    }

    findings
}
