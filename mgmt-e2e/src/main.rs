//! Management harness runner.
//!
//! Lists and runs the end-to-end scenarios against the simulated control
//! plane. Simulated runs use a paused clock, so hour-long scenarios finish
//! in seconds; `--real-time` keeps the wall clock.

#![forbid(unsafe_code)]

mod report;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use mgmt_common::HarnessConfig;
use mgmt_common::config::{LoadedConfig, Severity, validate_config};
use mgmt_core::{ScenarioContext, ScenarioDriver};
use report::RunSummary;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "mgmt-e2e")]
#[command(author, version, about = "Run management harness scenarios")]
struct Cli {
    /// Configuration file (default: <config dir>/mgmt-harness/config.toml)
    #[arg(short, long, global = true, env = "MGMT_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the known scenarios
    List {
        #[arg(long)]
        json: bool,
    },
    /// Run scenarios by name, or all of them
    Run {
        names: Vec<String>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,

        /// Let simulated time follow the wall clock
        #[arg(long)]
        real_time: bool,
    },
    /// Show the effective configuration and where its values came from
    Config {
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let loaded = HarnessConfig::load(cli.config.as_deref())?;
    let _guard = init_logging(&cli, &loaded.config)?;
    for err in &loaded.env_errors {
        warn!(error = %err, "ignoring environment override");
    }

    match cli.command {
        Command::List { json } => list(json),
        Command::Run {
            names,
            json,
            real_time,
        } => {
            check_config(&loaded.config)?;
            let runtime = runtime(real_time)?;
            let summary = runtime.block_on(run(loaded.config, &names))?;
            finish(&summary, json)
        }
        Command::Config { json } => show_config(&loaded, json),
    }
}

/// `MGMT_LOG` wins over `--verbose`, which wins over `general.log_level`.
fn init_logging(cli: &Cli, config: &HarnessConfig) -> Result<Option<WorkerGuard>> {
    let filter = match std::env::var("MGMT_LOG") {
        Ok(directives) => EnvFilter::try_new(directives).context("invalid MGMT_LOG")?,
        Err(_) if cli.verbose => EnvFilter::new("debug"),
        Err(_) => EnvFilter::try_new(&config.general.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let stderr = if config.general.log_json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    let (file, guard) = match &cli.log_file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(open_log_file(path)?);
            let layer = fmt::layer().json().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(file)
        .init();
    Ok(guard)
}

fn open_log_file(path: &Path) -> Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {}", path.display()))
}

fn runtime(real_time: bool) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_current_thread();
    builder.enable_all();
    if !real_time {
        builder.start_paused(true);
    }
    Ok(builder.build()?)
}

fn check_config(config: &HarnessConfig) -> Result<()> {
    let findings = validate_config(config);
    for finding in &findings {
        match finding.severity {
            Severity::Warning => warn!(field = %finding.field, "{}", finding.message),
            Severity::Error => error!(field = %finding.field, "{}", finding.message),
        }
    }
    let errors = findings.iter().filter(|f| f.severity == Severity::Error).count();
    if errors > 0 {
        bail!("configuration has {errors} error(s)");
    }
    Ok(())
}

fn list(json: bool) -> Result<()> {
    let scenarios = mgmt_core::scenarios::registry();
    if json {
        let entries: Vec<_> = scenarios
            .iter()
            .map(|s| serde_json::json!({"name": s.name, "description": s.description}))
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    let width = scenarios.iter().map(|s| s.name.len()).max().unwrap_or(0);
    for scenario in &scenarios {
        println!("{:<width$}  {}", scenario.name, scenario.description);
    }
    Ok(())
}

async fn run(config: HarnessConfig, names: &[String]) -> Result<RunSummary> {
    let started_at = chrono::Utc::now();
    let report_dir = config.general.report_dir.clone();
    let driver = ScenarioDriver::new(ScenarioContext::simulated(config));

    let reports = if names.is_empty() {
        driver.run_all().await
    } else {
        let mut reports = Vec::with_capacity(names.len());
        for name in names {
            reports.push(driver.run(name).await?);
        }
        reports
    };

    let summary = RunSummary::new(started_at, reports);
    if let Some(dir) = report_dir {
        let path = summary.write_to(&dir)?;
        info!(path = %path.display(), "report written");
    }
    Ok(summary)
}

fn finish(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        print!("{}", summary.render());
    }
    if !summary.all_passed() {
        bail!("{} of {} scenarios failed", summary.failed, summary.total);
    }
    Ok(())
}

fn show_config(loaded: &LoadedConfig, json: bool) -> Result<()> {
    let findings = validate_config(&loaded.config);
    if json {
        let doc = serde_json::json!({
            "path": loaded.path,
            "config": loaded.config.redacted(),
            "sources": loaded.sources,
            "findings": findings,
            "env_errors": loaded.env_errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    match &loaded.path {
        Some(path) => println!("# file: {}", path.display()),
        None => println!("# file: none (defaults)"),
    }
    print!("{}", loaded.config.to_redacted_toml()?);
    if !loaded.sources.is_empty() {
        println!();
        for source in &loaded.sources {
            match &source.detail {
                Some(detail) => println!("# {} <- {} ({detail})", source.key, source.source),
                None => println!("# {} <- {}", source.key, source.source),
            }
        }
    }
    for finding in &findings {
        println!("# {finding}");
    }
    for err in &loaded.env_errors {
        println!("# {err}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_accepts_names_and_flags() {
        let cli = Cli::try_parse_from(["mgmt-e2e", "run", "basic_backup", "cluster_crud", "--json"]).unwrap();
        match cli.command {
            Command::Run {
                names,
                json,
                real_time,
            } => {
                assert_eq!(names, vec!["basic_backup", "cluster_crud"]);
                assert!(json);
                assert!(!real_time);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from(["mgmt-e2e", "list", "--verbose", "--config", "/tmp/h.toml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config.as_deref(), Some(Path::new("/tmp/h.toml")));
    }

    #[test]
    fn default_config_passes_checks() {
        check_config(&HarnessConfig::default()).unwrap();
    }

    #[test]
    fn zero_step_is_refused() {
        let mut config = HarnessConfig::default();
        config.polling.step = std::time::Duration::ZERO;
        assert!(check_config(&config).is_err());
    }

    #[test]
    fn paused_runtime_skips_sleeps() {
        let runtime = runtime(false).unwrap();
        let elapsed = runtime.block_on(async {
            let started = std::time::Instant::now();
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            started.elapsed()
        });
        assert!(elapsed < std::time::Duration::from_secs(60));
    }
}
