//! Scenario driver end to end against the simulated control plane.
//!
//! Time is paused, so the multi-minute backups and repairs of the scenarios
//! complete instantly while keeping their relative timing.

use mgmt_common::HarnessConfig;
use mgmt_common::test_guard;
use mgmt_common::testing::{TestGuard, TestPhase, init_test_logging};
use mgmt_core::events::{EVENT_SCENARIO, EventBus, drain};
use mgmt_core::{ScenarioContext, ScenarioDriver, ScenarioReport};

fn driver() -> ScenarioDriver {
    init_test_logging();
    ScenarioDriver::new(ScenarioContext::simulated(HarnessConfig::default()))
}

fn assert_passed(report: &ScenarioReport) {
    assert!(
        report.passed,
        "scenario {} failed: {}",
        report.name,
        report.error.as_deref().unwrap_or("no error recorded")
    );
}

async fn run_one(name: &str) -> ScenarioReport {
    let guard = TestGuard::new(name);
    guard.log(TestPhase::Execute, format!("running {name}"));
    let report = driver().run(name).await.unwrap();
    if let Ok(data) = serde_json::to_value(&report) {
        guard.log_with_data(TestPhase::Verify, "scenario report", data);
    }
    assert_passed(&report);
    report
}

#[tokio::test(start_paused = true)]
async fn test_basic_backup_reports_timings() {
    let report = run_one("basic_backup").await;
    assert!(report.metrics.backup_secs.is_some_and(|s| s > 0.0));
    assert!(report.metrics.restore_secs.is_some_and(|s| s > 0.0));
    assert_eq!(report.metrics.task_ids.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_restore_with_task() {
    run_one("restore_with_task").await;
}

#[tokio::test(start_paused = true)]
async fn test_backup_rate_limit_is_slower() {
    let report = run_one("backup_rate_limit").await;
    assert_eq!(report.metrics.task_ids.len(), 2);
    // Upload stage at a quarter of the bandwidth.
    assert!(report.metrics.backup_secs.is_some_and(|s| s > 900.0));
}

#[tokio::test(start_paused = true)]
async fn test_backup_location_with_path_is_rejected() {
    let report = run_one("backup_location_with_path").await;
    assert!(report.metrics.task_ids.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_purge_orphans() {
    run_one("purge_orphans").await;
}

#[tokio::test(start_paused = true)]
async fn test_repair_control() {
    run_one("repair_control").await;
}

#[tokio::test(start_paused = true)]
async fn test_repair_multiple_keyspace_types() {
    run_one("repair_multiple_keyspace_types").await;
}

#[tokio::test(start_paused = true)]
async fn test_suspend_resume_backup() {
    run_one("suspend_resume_backup").await;
}

#[tokio::test(start_paused = true)]
async fn test_suspend_resume_repair() {
    run_one("suspend_resume_repair").await;
}

#[tokio::test(start_paused = true)]
async fn test_suspend_without_start() {
    run_one("suspend_without_start").await;
}

#[tokio::test(start_paused = true)]
async fn test_suspend_auto_resume_after_duration() {
    run_one("suspend_auto_resume_after_duration").await;
}

#[tokio::test(start_paused = true)]
async fn test_suspend_resume_before_duration() {
    run_one("suspend_resume_before_duration").await;
}

#[tokio::test(start_paused = true)]
async fn test_enospc_before_restore() {
    run_one("enospc_before_restore").await;
}

#[tokio::test(start_paused = true)]
async fn test_enospc_during_backup() {
    run_one("enospc_during_backup").await;
}

#[tokio::test(start_paused = true)]
async fn test_cluster_healthcheck() {
    run_one("cluster_healthcheck").await;
}

#[tokio::test(start_paused = true)]
async fn test_cluster_crud() {
    run_one("cluster_crud").await;
}

#[tokio::test(start_paused = true)]
async fn test_client_encryption() {
    run_one("client_encryption").await;
}

#[tokio::test(start_paused = true)]
async fn test_run_all_shares_one_simulator() {
    let guard = test_guard!();
    let driver = driver();
    let reports = driver.run_all().await;
    assert_eq!(reports.len(), driver.scenarios().len());
    for report in &reports {
        guard.log(TestPhase::Verify, format!("{}: passed={}", report.name, report.passed));
        assert_passed(report);
    }
    let names: Vec<_> = reports.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names.last(), Some(&"client_encryption"));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_scenario_lists_known_names() {
    let err = driver().run("no_such_scenario").await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("no_such_scenario"));
    assert!(message.contains("basic_backup"));
}

#[tokio::test(start_paused = true)]
async fn test_scenario_outcome_is_published() {
    let events = EventBus::new(1024);
    let mut rx = events.subscribe();
    let ctx = ScenarioContext::simulated(HarnessConfig::default()).with_events(events);
    let report = ScenarioDriver::new(ctx).run("cluster_crud").await.unwrap();
    assert_passed(&report);

    let finished: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter(|e| e["event"] == EVENT_SCENARIO)
        .collect();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0]["data"]["name"], "cluster_crud");
    assert_eq!(finished[0]["data"]["passed"], true);
}

#[tokio::test(start_paused = true)]
async fn test_registry_names_are_unique() {
    let driver = driver();
    let mut names: Vec<_> = driver.scenarios().iter().map(|s| s.name).collect();
    let total = names.len();
    names.sort_unstable();
    names.dedup();
    assert_eq!(names.len(), total);
    assert!(driver.scenarios().iter().all(|s| !s.description.is_empty()));
}
