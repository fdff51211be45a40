//! Environment variable parsing with type safety.
//!
//! All harness variables share the `MGMT_` prefix. Parse errors are
//! collected rather than returned so every bad variable is reported at once;
//! the default is kept for a value that failed to parse.

use super::source::Sourced;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EnvError {
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    #[error("Invalid duration for {var}: {value}")]
    InvalidDuration { var: String, value: String },

    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("Invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },
}

/// Type-safe environment variable parser.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    pub fn new() -> Self {
        Self {
            prefix: "MGMT_",
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    /// Full variable name with prefix.
    pub fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    pub fn get_string(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => Sourced::from_env(value, var_name),
            Err(_) => Sourced::default_value(default.to_string()),
        }
    }

    /// Accepts 1/true/yes/on and 0/false/no/off/"" in any case.
    pub fn get_bool(&mut self, name: &str, default: bool) -> Sourced<bool> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => {
                let parsed = match value.to_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => true,
                    "0" | "false" | "no" | "off" | "" => false,
                    _ => {
                        self.errors.push(EnvError::InvalidValue {
                            var: var_name.clone(),
                            expected: "boolean (true/false/1/0/yes/no)".to_string(),
                            value: value.clone(),
                        });
                        default
                    }
                };
                Sourced::from_env(parsed, var_name)
            }
            Err(_) => Sourced::default_value(default),
        }
    }

    pub fn get_u32_range(&mut self, name: &str, default: u32, min: u32, max: u32) -> Sourced<u32> {
        self.get_ranged(name, default, min, max, "unsigned 32-bit integer")
    }

    pub fn get_f64_range(&mut self, name: &str, default: f64, min: f64, max: f64) -> Sourced<f64> {
        self.get_ranged(name, default, min, max, "floating-point number")
    }

    fn get_ranged<T>(&mut self, name: &str, default: T, min: T, max: T, expected: &str) -> Sourced<T>
    where
        T: std::str::FromStr + PartialOrd + ToString + Copy,
    {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => match value.trim().parse::<T>() {
                Ok(n) if n >= min && n <= max => Sourced::from_env(n, var_name),
                Ok(n) => {
                    self.errors.push(EnvError::OutOfRange {
                        var: var_name.clone(),
                        value: n.to_string(),
                        min: min.to_string(),
                        max: max.to_string(),
                    });
                    Sourced::from_env(default, var_name)
                }
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var: var_name.clone(),
                        expected: expected.to_string(),
                        value,
                    });
                    Sourced::default_value(default)
                }
            },
            Err(_) => Sourced::default_value(default),
        }
    }

    /// Durations use humantime syntax ("90s", "25m", "1h 30m").
    /// A bare integer is read as seconds.
    pub fn get_duration(&mut self, name: &str, default: Duration) -> Sourced<Duration> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => {
                let trimmed = value.trim();
                let parsed = trimmed
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .or_else(|_| humantime::parse_duration(trimmed));
                match parsed {
                    Ok(d) => Sourced::from_env(d, var_name),
                    Err(_) => {
                        self.errors.push(EnvError::InvalidDuration {
                            var: var_name.clone(),
                            value,
                        });
                        Sourced::default_value(default)
                    }
                }
            }
            Err(_) => Sourced::default_value(default),
        }
    }

    /// Path with `~` expanded.
    pub fn get_optional_path(&mut self, name: &str) -> Sourced<Option<PathBuf>> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) if value.is_empty() => Sourced::from_env(None, var_name),
            Ok(value) => {
                let expanded = match value.strip_prefix("~/") {
                    Some(stripped) => dirs::home_dir()
                        .map(|home| home.join(stripped))
                        .unwrap_or_else(|| PathBuf::from(&value)),
                    None => PathBuf::from(&value),
                };
                Sourced::from_env(Some(expanded), var_name)
            }
            Err(_) => Sourced::default_value(None),
        }
    }

    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => {
                let lower = value.to_lowercase();
                match lower.as_str() {
                    "trace" | "debug" | "info" | "warn" | "error" | "off" => Sourced::from_env(lower, var_name),
                    _ => {
                        self.errors.push(EnvError::InvalidLogLevel {
                            var: var_name.clone(),
                            value: value.clone(),
                        });
                        Sourced::from_env(default.to_string(), var_name)
                    }
                }
            }
            Err(_) => Sourced::default_value(default.to_string()),
        }
    }

    /// Comma-separated list of strings.
    pub fn get_string_list(&mut self, name: &str, default: Vec<String>) -> Sourced<Vec<String>> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) => {
                let items: Vec<String> = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                Sourced::from_env(items, var_name)
            }
            Err(_) => Sourced::default_value(default),
        }
    }

    /// None if not set or empty.
    pub fn get_optional_string(&mut self, name: &str) -> Sourced<Option<String>> {
        let var_name = self.var_name(name);
        match env::var(&var_name) {
            Ok(value) if value.is_empty() => Sourced::from_env(None, var_name),
            Ok(value) => Sourced::from_env(Some(value), var_name),
            Err(_) => Sourced::default_value(None),
        }
    }
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;

    fn cleanup_env(vars: &[&str]) {
        for var in vars {
            // SAFETY: env access is serialized by env_test_lock
            unsafe { env::remove_var(var) };
        }
    }

    fn set_env(key: &str, value: &str) {
        // SAFETY: env access is serialized by env_test_lock
        unsafe { env::set_var(key, value) };
    }

    #[test]
    fn test_get_bool_values() {
        let _guard = env_test_lock();
        let vars = ["MGMT_TEST_BOOL"];
        cleanup_env(&vars);

        for val in ["1", "true", "YES", "on"] {
            set_env("MGMT_TEST_BOOL", val);
            let mut parser = EnvParser::new();
            assert!(parser.get_bool("TEST_BOOL", false).value, "expected true for '{val}'");
            assert!(!parser.has_errors());
        }
        for val in ["0", "false", "No", ""] {
            set_env("MGMT_TEST_BOOL", val);
            let mut parser = EnvParser::new();
            assert!(!parser.get_bool("TEST_BOOL", true).value, "expected false for '{val}'");
        }

        set_env("MGMT_TEST_BOOL", "maybe");
        let mut parser = EnvParser::new();
        assert!(!parser.get_bool("TEST_BOOL", false).value);
        assert!(parser.has_errors());

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_u32_out_of_range_keeps_default() {
        let _guard = env_test_lock();
        let vars = ["MGMT_TEST_U32_OOR"];
        cleanup_env(&vars);

        set_env("MGMT_TEST_U32_OOR", "200");
        let mut parser = EnvParser::new();
        let result = parser.get_u32_range("TEST_U32_OOR", 5, 1, 100);
        assert_eq!(result.value, 5);
        assert!(matches!(parser.errors()[0], EnvError::OutOfRange { .. }));

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_duration_accepts_humantime_and_seconds() {
        let _guard = env_test_lock();
        let vars = ["MGMT_TEST_DUR"];
        cleanup_env(&vars);

        set_env("MGMT_TEST_DUR", "25m");
        let mut parser = EnvParser::new();
        let result = parser.get_duration("TEST_DUR", Duration::from_secs(1));
        assert_eq!(result.value, Duration::from_secs(1500));
        assert!(result.is_from_env());

        set_env("MGMT_TEST_DUR", "90");
        assert_eq!(parser.get_duration("TEST_DUR", Duration::ZERO).value, Duration::from_secs(90));

        set_env("MGMT_TEST_DUR", "soon");
        let result = parser.get_duration("TEST_DUR", Duration::from_secs(7));
        assert_eq!(result.value, Duration::from_secs(7));
        assert_eq!(parser.take_errors().len(), 1);

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_string_list_trims_and_skips_empty() {
        let _guard = env_test_lock();
        let vars = ["MGMT_TEST_LIST"];
        cleanup_env(&vars);

        set_env("MGMT_TEST_LIST", "s3:a, gcs:b,,");
        let mut parser = EnvParser::new();
        let result = parser.get_string_list("TEST_LIST", vec![]);
        assert_eq!(result.value, vec!["s3:a".to_string(), "gcs:b".to_string()]);

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_log_level_rejects_unknown() {
        let _guard = env_test_lock();
        let vars = ["MGMT_TEST_LEVEL"];
        cleanup_env(&vars);

        set_env("MGMT_TEST_LEVEL", "DEBUG");
        let mut parser = EnvParser::new();
        assert_eq!(parser.get_log_level("TEST_LEVEL", "info").value, "debug");

        set_env("MGMT_TEST_LEVEL", "chatty");
        assert_eq!(parser.get_log_level("TEST_LEVEL", "info").value, "info");
        assert!(parser.has_errors());

        cleanup_env(&vars);
    }

    #[test]
    fn test_unset_values_are_defaults() {
        let _guard = env_test_lock();
        cleanup_env(&["MGMT_TEST_UNSET"]);
        let mut parser = EnvParser::new();
        let result = parser.get_optional_string("TEST_UNSET");
        assert_eq!(result.value, None);
        assert!(!result.is_from_env());
        assert!(parser.get_optional_path("TEST_UNSET").value.is_none());
    }
}
