//! Tracking where configuration values came from.

use serde::Serialize;
use std::fmt;
use std::path::Path;

/// Layer that supplied a configuration value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
    Cli,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Default => "default",
            Self::File => "file",
            Self::Environment => "env",
            Self::Cli => "cli",
        };
        f.write_str(label)
    }
}

/// A value paired with its source.
#[derive(Debug, Clone, PartialEq)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
    /// Environment variable name, when the value came from the environment.
    pub env_var: Option<String>,
}

impl<T> Sourced<T> {
    pub fn default_value(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Default,
            env_var: None,
        }
    }

    pub fn from_env(value: T, var: impl Into<String>) -> Self {
        Self {
            value,
            source: ConfigSource::Environment,
            env_var: Some(var.into()),
        }
    }

    pub fn is_from_env(&self) -> bool {
        self.source == ConfigSource::Environment
    }
}

/// Where one effective configuration key came from, for `config` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigValueSource {
    pub key: String,
    pub source: ConfigSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ConfigValueSource {
    pub fn file(key: &str, path: &Path) -> Self {
        Self {
            key: key.to_string(),
            source: ConfigSource::File,
            detail: Some(path.display().to_string()),
        }
    }

    pub fn env(key: &str, var: &str) -> Self {
        Self {
            key: key.to_string(),
            source: ConfigSource::Environment,
            detail: Some(var.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sourced_constructors() {
        let d = Sourced::default_value(5u32);
        assert_eq!(d.source, ConfigSource::Default);
        assert!(!d.is_from_env());

        let e = Sourced::from_env("x".to_string(), "MGMT_X");
        assert!(e.is_from_env());
        assert_eq!(e.env_var.as_deref(), Some("MGMT_X"));
    }

    #[test]
    fn test_source_display() {
        assert_eq!(ConfigSource::Environment.to_string(), "env");
        assert_eq!(ConfigSource::File.to_string(), "file");
    }
}
