//! Test support shared by the harness crates.

mod log;

pub use log::{TestGuard, TestLogEntry, TestLogger, TestPhase, init_test_logging};
