//! Error catalog for the management harness.
//!
//! Every failure the harness can raise maps to a stable code
//! (`MGMT-E001` through `MGMT-E599`) with a message and remediation steps,
//! so scenario reports stay comparable across runs.
//!
//! # Error Code Ranges
//!
//! | Range      | Category    | Description                               |
//! |------------|-------------|-------------------------------------------|
//! | E001-E099  | Config      | Configuration and parameter setup errors  |
//! | E100-E199  | Transport   | SSH, API reachability, remote commands    |
//! | E200-E299  | Rejection   | Control plane refused or could not find   |
//! | E300-E399  | Poll        | Waits that ran out of time or saw a race  |
//! | E500-E599  | Internal    | Capability mismatches and harness bugs    |

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error code enumeration covering all harness failure scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    // =========================================================================
    // Config Errors (E001-E099)
    // =========================================================================
    /// Configuration file not found
    ConfigNotFound,
    /// Configuration file could not be read
    ConfigReadError,
    /// Configuration file contains invalid TOML syntax
    ConfigParseError,
    /// Configuration contains invalid values
    ConfigValidationError,
    /// Environment variable has invalid value
    ConfigEnvError,
    /// Backup location does not match `<provider>:<bucket>`
    ConfigInvalidLocation,

    // =========================================================================
    // Transport Errors (E100-E199)
    // =========================================================================
    /// SSH connection failed
    SshConnectionFailed,
    /// Remote command exceeded its timeout
    SshTimeout,
    /// Remote command exited with an unexpected status
    RemoteCommandFailed,
    /// Control plane API could not be reached
    ApiUnreachable,

    // =========================================================================
    // Rejection Errors (E200-E299)
    // =========================================================================
    /// Control plane rejected the request
    OperationRejected,
    /// Referenced cluster or task does not exist
    ResourceNotFound,
    /// Task parameters failed validation before submission
    InvalidParameters,

    // =========================================================================
    // Poll Errors (E300-E399)
    // =========================================================================
    /// A mandatory wait ran out of time
    PollTimeout,
    /// A task left STOPPED while a suspension was expected to hold it
    PrematureResume,
    /// Tasks did not reach STOPPED within the bound
    TasksNotStopped,

    // =========================================================================
    // Internal Errors (E500-E599)
    // =========================================================================
    /// Operation is not supported by the task kind
    CapabilityMismatch,
    /// Internal state is inconsistent
    InternalStateError,
    /// Serialization or deserialization failed
    InternalSerdeError,
}

impl ErrorCode {
    /// Returns the numeric part of the error code.
    #[must_use]
    pub const fn code_number(&self) -> u16 {
        match self {
            // Config (1-99)
            Self::ConfigNotFound => 1,
            Self::ConfigReadError => 2,
            Self::ConfigParseError => 3,
            Self::ConfigValidationError => 4,
            Self::ConfigEnvError => 5,
            Self::ConfigInvalidLocation => 6,

            // Transport (100-199)
            Self::SshConnectionFailed => 100,
            Self::SshTimeout => 101,
            Self::RemoteCommandFailed => 102,
            Self::ApiUnreachable => 103,

            // Rejection (200-299)
            Self::OperationRejected => 200,
            Self::ResourceNotFound => 201,
            Self::InvalidParameters => 202,

            // Poll (300-399)
            Self::PollTimeout => 300,
            Self::PrematureResume => 301,
            Self::TasksNotStopped => 302,

            // Internal (500-599)
            Self::CapabilityMismatch => 500,
            Self::InternalStateError => 501,
            Self::InternalSerdeError => 502,
        }
    }

    /// Returns the formatted error code string (e.g., "MGMT-E001").
    #[must_use]
    pub fn code_string(&self) -> String {
        format!("MGMT-E{:03}", self.code_number())
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self.code_number() {
            1..=99 => ErrorCategory::Config,
            100..=199 => ErrorCategory::Transport,
            200..=299 => ErrorCategory::Rejection,
            300..=399 => ErrorCategory::Poll,
            _ => ErrorCategory::Internal,
        }
    }

    /// Returns the human-readable message.
    #[must_use]
    pub const fn message(&self) -> &'static str {
        match self {
            Self::ConfigNotFound => "Configuration file not found",
            Self::ConfigReadError => "Configuration file could not be read",
            Self::ConfigParseError => "Configuration file contains invalid TOML",
            Self::ConfigValidationError => "Configuration contains invalid values",
            Self::ConfigEnvError => "Environment variable has an invalid value",
            Self::ConfigInvalidLocation => "Backup location is malformed",
            Self::SshConnectionFailed => "SSH connection failed",
            Self::SshTimeout => "Remote command timed out",
            Self::RemoteCommandFailed => "Remote command exited with a failure status",
            Self::ApiUnreachable => "Control plane API is unreachable",
            Self::OperationRejected => "Control plane rejected the request",
            Self::ResourceNotFound => "Cluster or task not found",
            Self::InvalidParameters => "Task parameters are invalid",
            Self::PollTimeout => "Timed out waiting for a condition",
            Self::PrematureResume => "Task resumed while suspension was expected to hold",
            Self::TasksNotStopped => "Tasks did not stop within the bound",
            Self::CapabilityMismatch => "Operation not supported for this task kind",
            Self::InternalStateError => "Internal harness state is inconsistent",
            Self::InternalSerdeError => "Serialization failed",
        }
    }

    /// Returns remediation steps for the error.
    #[must_use]
    pub fn remediation(&self) -> Vec<&'static str> {
        match self {
            Self::ConfigNotFound => vec![
                "Pass --config with the path to a harness TOML file",
                "Or rely on defaults and MGMT_* environment overrides",
            ],
            Self::ConfigReadError => vec!["Check file permissions on the configuration file"],
            Self::ConfigParseError => vec![
                "Validate the TOML syntax",
                "Durations use humantime syntax such as \"30s\" or \"25m\"",
            ],
            Self::ConfigValidationError => vec![
                "Review the reported field and its allowed range",
                "Run `mgmt-e2e config` to print the effective configuration",
            ],
            Self::ConfigEnvError => vec![
                "Check the MGMT_* environment variable named in the error",
                "Booleans accept true/false/1/0/yes/no",
            ],
            Self::ConfigInvalidLocation => vec![
                "Use the form <provider>:<bucket> with provider s3, gcs or azure",
                "Do not append a path below the bucket",
            ],
            Self::SshConnectionFailed => vec![
                "Verify the node is reachable: ssh -o BatchMode=yes <host> true",
                "Check the identity file configured for the node",
            ],
            Self::SshTimeout => vec![
                "Increase the command timeout",
                "Check whether the remote command hangs on input",
            ],
            Self::RemoteCommandFailed => vec!["Inspect the captured stderr of the command"],
            Self::ApiUnreachable => vec![
                "Check that the manager server is running",
                "Transient failures are retried by the poller",
            ],
            Self::OperationRejected => vec![
                "Read the rejection reason returned by the control plane",
                "Check the task state before issuing stop/start",
            ],
            Self::ResourceNotFound => vec!["Verify the cluster is registered and the task id is current"],
            Self::InvalidParameters => vec![
                "Provide at least one backup location",
                "Restore requires a snapshot tag and schema or data selection",
            ],
            Self::PollTimeout => vec![
                "Increase the wait timeout",
                "Inspect the task progress to see where it stalled",
            ],
            Self::PrematureResume => vec![
                "Check for a scheduled auto-resume on the suspension",
                "Verify nothing else resumed the cluster",
            ],
            Self::TasksNotStopped => vec!["Suspend with stop_tasks enabled to force-stop running tasks"],
            Self::CapabilityMismatch => vec!["Use the accessor matching the task kind"],
            Self::InternalStateError => vec!["Re-run with MGMT_LOG=debug and report the log"],
            Self::InternalSerdeError => vec!["Check that the control plane version matches the harness"],
        }
    }

    /// Returns the complete error entry.
    #[must_use]
    pub fn entry(&self) -> ErrorEntry {
        ErrorEntry {
            code: self.code_string(),
            category: self.category(),
            message: self.message().to_string(),
            remediation: self.remediation().into_iter().map(String::from).collect(),
        }
    }

    /// Returns every error code, in code order.
    #[must_use]
    pub fn all() -> &'static [ErrorCode] {
        &[
            Self::ConfigNotFound,
            Self::ConfigReadError,
            Self::ConfigParseError,
            Self::ConfigValidationError,
            Self::ConfigEnvError,
            Self::ConfigInvalidLocation,
            Self::SshConnectionFailed,
            Self::SshTimeout,
            Self::RemoteCommandFailed,
            Self::ApiUnreachable,
            Self::OperationRejected,
            Self::ResourceNotFound,
            Self::InvalidParameters,
            Self::PollTimeout,
            Self::PrematureResume,
            Self::TasksNotStopped,
            Self::CapabilityMismatch,
            Self::InternalStateError,
            Self::InternalSerdeError,
        ]
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code_string(), self.message())
    }
}

/// Error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Configuration errors (E001-E099)
    Config,
    /// Network, SSH and API reachability errors (E100-E199)
    Transport,
    /// Control plane rejections (E200-E299)
    Rejection,
    /// Wait and race failures (E300-E399)
    Poll,
    /// Internal errors (E500-E599)
    Internal,
}

impl ErrorCategory {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Config => "Configuration",
            Self::Transport => "Transport",
            Self::Rejection => "Rejection",
            Self::Poll => "Poll",
            Self::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Complete error entry with all metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    /// Error code string (e.g., "MGMT-E001")
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
    pub remediation: Vec<String>,
}

impl ErrorEntry {
    /// Formats the error for display with full remediation steps.
    #[must_use]
    pub fn format_full(&self) -> String {
        let mut output = format!("[{}] {}\n\n", self.code, self.message);

        if !self.remediation.is_empty() {
            output.push_str("Remediation steps:\n");
            for (i, step) in self.remediation.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, step));
            }
        }

        output
    }

    /// Formats the error as a single line.
    #[must_use]
    pub fn format_brief(&self) -> String {
        format!("[{}] {}", self.code, self.message)
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_brief())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_numbers_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for code in ErrorCode::all() {
            let num = code.code_number();
            assert!(seen.insert(num), "Duplicate error code number: {num} for {code:?}");
        }
    }

    #[test]
    fn test_code_string_format() {
        assert_eq!(ErrorCode::ConfigNotFound.code_string(), "MGMT-E001");
        assert_eq!(ErrorCode::SshConnectionFailed.code_string(), "MGMT-E100");
        assert_eq!(ErrorCode::PollTimeout.code_string(), "MGMT-E300");
        assert_eq!(ErrorCode::CapabilityMismatch.code_string(), "MGMT-E500");
    }

    #[test]
    fn test_category_ranges() {
        for code in ErrorCode::all() {
            let num = code.code_number();
            match code.category() {
                ErrorCategory::Config => assert!(num < 100, "{code:?} should be < 100"),
                ErrorCategory::Transport => {
                    assert!((100..200).contains(&num), "{code:?} should be 100-199")
                }
                ErrorCategory::Rejection => {
                    assert!((200..300).contains(&num), "{code:?} should be 200-299")
                }
                ErrorCategory::Poll => {
                    assert!((300..400).contains(&num), "{code:?} should be 300-399")
                }
                ErrorCategory::Internal => {
                    assert!((500..600).contains(&num), "{code:?} should be 500-599")
                }
            }
        }
    }

    #[test]
    fn test_all_errors_have_message_and_remediation() {
        for code in ErrorCode::all() {
            assert!(!code.message().is_empty(), "{code:?} has empty message");
            assert!(!code.remediation().is_empty(), "{code:?} has no remediation");
        }
    }

    #[test]
    fn test_error_entry_serialization() {
        let entry = ErrorCode::PrematureResume.entry();
        let json = serde_json::to_string(&entry).expect("serialization failed");
        assert!(json.contains("MGMT-E301"));
        assert!(json.contains("\"poll\""));

        let parsed: ErrorEntry = serde_json::from_str(&json).expect("deserialization failed");
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_format_full_lists_steps() {
        let formatted = ErrorCode::ConfigInvalidLocation.entry().format_full();
        assert!(formatted.starts_with("[MGMT-E006] Backup location is malformed"));
        assert!(formatted.contains("Remediation steps:"));
        assert!(formatted.contains("1. Use the form"));
    }

    #[test]
    fn test_display() {
        let display = ErrorCode::TasksNotStopped.to_string();
        assert_eq!(display, "MGMT-E302: Tasks did not stop within the bound");
        assert_eq!(ErrorCategory::Config.to_string(), "Configuration");
    }
}
