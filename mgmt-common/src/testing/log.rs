//! Structured logging for tests.
//!
//! Scenario tests run for long stretches of virtual time and are hard to
//! debug from an assertion message alone. Two helpers cover that:
//!
//! * [`init_test_logging`] installs a compact subscriber that writes through
//!   the libtest capture, so output only shows for failing tests.
//! * [`TestGuard`] (usually via [`test_guard!`](crate::test_guard)) records
//!   phase-tagged JSONL entries under `target/test-logs/` and logs PASS/FAIL
//!   on drop.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, Once};
use std::time::Instant;
use tracing_subscriber::prelude::*;

/// Test execution phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPhase {
    Setup,
    Execute,
    Verify,
    Teardown,
}

impl std::fmt::Display for TestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Setup => write!(f, "setup"),
            Self::Execute => write!(f, "execute"),
            Self::Verify => write!(f, "verify"),
            Self::Teardown => write!(f, "teardown"),
        }
    }
}

static LOGGING_INIT: Once = Once::new();

/// Install the test subscriber. Safe to call from every test.
///
/// `MGMT_TEST_LOG_LEVEL` overrides the default `info` filter for the
/// harness crates; `MGMT_TEST_LOG_FILE` additionally mirrors events as JSON
/// lines into the given file.
pub fn init_test_logging() {
    LOGGING_INIT.call_once(|| {
        let level = std::env::var("MGMT_TEST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let filter = tracing_subscriber::EnvFilter::try_new(format!(
            "mgmt_common={level},mgmt_core={level},mgmt_e2e={level}"
        ))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let file_layer = std::env::var("MGMT_TEST_LOG_FILE")
            .ok()
            .and_then(|path| {
                if let Some(parent) = PathBuf::from(&path).parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                std::fs::File::create(path).ok()
            })
            .map(|file| {
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(Mutex::new(file))
                    .with_current_span(true)
            });

        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_target(true)
            .compact();

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(stderr_layer);

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// One JSONL record written by [`TestLogger`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestLogEntry {
    /// RFC 3339 wall-clock timestamp.
    pub timestamp: String,
    pub test_name: String,
    pub phase: TestPhase,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Real (not virtual) milliseconds since the test started.
    pub elapsed_ms: u64,
}

/// Per-test JSONL logger.
pub struct TestLogger {
    test_name: String,
    start_time: Instant,
    entries: Mutex<Vec<TestLogEntry>>,
    log_file: Option<Mutex<std::fs::File>>,
}

impl TestLogger {
    pub fn for_test(test_name: &str) -> Self {
        let logger = Self {
            test_name: test_name.to_string(),
            start_time: Instant::now(),
            entries: Mutex::new(Vec::new()),
            log_file: create_log_file(test_name).ok().map(Mutex::new),
        };
        logger.log(TestPhase::Setup, "TEST START");
        logger
    }

    pub fn log(&self, phase: TestPhase, message: impl Into<String>) {
        self.write_entry(phase, message.into(), None);
    }

    pub fn log_with_data(&self, phase: TestPhase, message: impl Into<String>, data: serde_json::Value) {
        self.write_entry(phase, message.into(), Some(data));
    }

    /// Entries recorded so far.
    pub fn entries(&self) -> Vec<TestLogEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn write_entry(&self, phase: TestPhase, message: String, data: Option<serde_json::Value>) {
        let entry = TestLogEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            test_name: self.test_name.clone(),
            phase,
            message,
            data,
            elapsed_ms: self.start_time.elapsed().as_millis() as u64,
        };

        if let Some(file) = &self.log_file
            && let Ok(mut f) = file.lock()
            && let Ok(json) = serde_json::to_string(&entry)
        {
            let _ = writeln!(f, "{json}");
        }

        tracing::info!(test = %self.test_name, phase = %entry.phase, "{}", entry.message);

        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }
}

fn create_log_file(test_name: &str) -> std::io::Result<std::fs::File> {
    let log_dir = find_target_dir().join("test-logs");
    std::fs::create_dir_all(&log_dir)?;
    let safe_name = test_name.replace("::", "_").replace(['/', '\\'], "_");
    std::fs::File::create(log_dir.join(format!("{safe_name}.jsonl")))
}

fn find_target_dir() -> PathBuf {
    if let Ok(target_dir) = std::env::var("CARGO_TARGET_DIR") {
        return PathBuf::from(target_dir);
    }
    let mut cwd = std::env::current_dir().unwrap_or_default();
    loop {
        let target = cwd.join("target");
        if target.is_dir() {
            return target;
        }
        if !cwd.pop() {
            return PathBuf::from("target");
        }
    }
}

/// Test logger that records PASS, or FAIL when dropped during a panic.
///
/// Enabled with `MGMT_TEST_LOGGING=1`, and by default when `CI` is set.
/// Disabled guards are no-ops.
pub struct TestGuard {
    inner: Option<TestLogger>,
}

impl TestGuard {
    pub fn new(test_name: &str) -> Self {
        init_test_logging();
        let enabled = match std::env::var("MGMT_TEST_LOGGING").as_deref() {
            Ok("1" | "true") => true,
            Ok("0" | "false") => false,
            _ => std::env::var("CI").is_ok(),
        };
        Self {
            inner: enabled.then(|| TestLogger::for_test(test_name)),
        }
    }

    pub fn log(&self, phase: TestPhase, message: impl Into<String>) {
        if let Some(logger) = &self.inner {
            logger.log(phase, message);
        }
    }

    pub fn log_with_data(&self, phase: TestPhase, message: impl Into<String>, data: serde_json::Value) {
        if let Some(logger) = &self.inner {
            logger.log_with_data(phase, message, data);
        }
    }
}

impl Drop for TestGuard {
    fn drop(&mut self) {
        if let Some(logger) = self.inner.take() {
            if std::thread::panicking() {
                logger.log(TestPhase::Verify, "TEST FAIL");
            } else {
                logger.log(TestPhase::Verify, "TEST PASS");
            }
        }
    }
}

/// Create a [`TestGuard`] named after the enclosing function.
#[macro_export]
macro_rules! test_guard {
    () => {{
        fn _f() {}
        fn _type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = _type_name_of(_f);
        let name = name.strip_suffix("::_f").unwrap_or(name);
        let name = name.rsplit("::").next().unwrap_or(name);
        $crate::testing::TestGuard::new(name)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_records_start_and_messages() {
        let logger = TestLogger::for_test("test_logger_records_start_and_messages");
        logger.log(TestPhase::Execute, "polling");
        logger.log_with_data(TestPhase::Verify, "status", serde_json::json!({"status": "DONE"}));

        let entries = logger.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "TEST START");
        assert_eq!(entries[2].data.as_ref().unwrap()["status"], "DONE");
    }

    #[test]
    fn test_entry_serializes_phase_snake_case() {
        let logger = TestLogger::for_test("test_entry_serializes_phase_snake_case");
        let json = serde_json::to_string(&logger.entries()[0]).unwrap();
        assert!(json.contains("\"phase\":\"setup\""));
        assert!(!json.contains("\"data\""));
    }

    #[test]
    fn test_disabled_guard_is_noop() {
        let guard = TestGuard { inner: None };
        guard.log(TestPhase::Execute, "ignored");
    }

    #[test]
    fn test_init_is_idempotent() {
        init_test_logging();
        init_test_logging();
        let _guard = crate::test_guard!();
    }
}
