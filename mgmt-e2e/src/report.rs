//! Run summaries: terminal table, JSON document and report files.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mgmt_core::ScenarioReport;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Scenario time, virtual unless the run used the real clock.
    pub duration_secs: f64,
    pub scenarios: Vec<ScenarioReport>,
}

impl RunSummary {
    pub fn new(started_at: DateTime<Utc>, scenarios: Vec<ScenarioReport>) -> Self {
        let passed = scenarios.iter().filter(|r| r.passed).count();
        Self {
            started_at,
            total: scenarios.len(),
            passed,
            failed: scenarios.len() - passed,
            duration_secs: scenarios.iter().map(|r| r.duration_secs).sum(),
            scenarios,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }

    pub fn render(&self) -> String {
        let width = self
            .scenarios
            .iter()
            .map(|r| r.name.len())
            .max()
            .unwrap_or(0);
        let mut out = String::new();
        for report in &self.scenarios {
            let verdict = if report.passed { "PASS" } else { "FAIL" };
            out.push_str(&format!(
                "{verdict}  {:<width$}  {:>8.1}s",
                report.name, report.duration_secs
            ));
            if let Some(secs) = report.metrics.backup_secs {
                out.push_str(&format!("  backup {secs:.0}s"));
            }
            if let Some(secs) = report.metrics.restore_secs {
                out.push_str(&format!("  restore {secs:.0}s"));
            }
            out.push('\n');
            if let Some(error) = &report.error {
                out.push_str(&format!("      {error}\n"));
            }
        }
        out.push_str(&format!(
            "\n{} passed, {} failed, {:.1}s\n",
            self.passed, self.failed, self.duration_secs
        ));
        out
    }

    /// Write `report-<timestamp>.json` into `dir`, creating it if needed.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir).with_context(|| format!("creating report directory {}", dir.display()))?;
        let path = dir.join(format!("report-{}.json", self.started_at.format("%Y%m%dT%H%M%SZ")));
        let body = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, body).with_context(|| format!("writing report {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mgmt_core::ScenarioMetrics;

    fn report(name: &str, passed: bool) -> ScenarioReport {
        ScenarioReport {
            name: name.to_string(),
            passed,
            error: (!passed).then(|| "task backup/1 ended in ERROR instead of DONE".to_string()),
            duration_secs: 310.0,
            metrics: ScenarioMetrics {
                backup_secs: Some(302.0),
                ..ScenarioMetrics::default()
            },
        }
    }

    #[test]
    fn summary_counts_failures() {
        let summary = RunSummary::new(Utc::now(), vec![report("basic_backup", true), report("purge_orphans", false)]);
        assert_eq!(summary.total, 2);
        assert_eq!(summary.failed, 1);
        assert!(!summary.all_passed());
        assert_eq!(summary.duration_secs, 620.0);
    }

    #[test]
    fn render_shows_errors_under_failed_scenarios() {
        let summary = RunSummary::new(Utc::now(), vec![report("basic_backup", true), report("purge_orphans", false)]);
        let text = summary.render();
        assert!(text.contains("PASS  basic_backup"));
        assert!(text.contains("FAIL  purge_orphans"));
        assert!(text.contains("backup 302s"));
        assert!(text.contains("ended in ERROR"));
        assert!(text.ends_with("1 passed, 1 failed, 620.0s\n"));
    }

    #[test]
    fn write_to_creates_directory_and_json() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("reports");
        let summary = RunSummary::new(Utc::now(), vec![report("cluster_crud", true)]);
        let path = summary.write_to(&dir).unwrap();
        assert!(path.starts_with(&dir));

        let parsed: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["total"], 1);
        assert_eq!(parsed["scenarios"][0]["name"], "cluster_crud");
        assert_eq!(parsed["scenarios"][0]["metrics"]["backup_secs"], 302.0);
    }
}
