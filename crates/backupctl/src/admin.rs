//! Administrative commands: register, remove, enable, disable, status.
//!
//! Each returns `Ok(true)` when every target succeeded, `Ok(false)` when the
//! command ran but something needs the user's attention (exit code 1), and
//! `Err` on a fatal error.

use std::path::Path;
use std::sync::OnceLock;

use backupctl_scheduler::{BatchReport, Job, JobManager, JobStatus, Registration};
use miette::Result;
use regex::Regex;
use tracing::{debug, info};

use crate::plan::Plan;
use crate::reporter::Reporter;
use crate::settings::Settings;

const SCHEDULE_MACROS: &[&str] = &[
    "@reboot", "@yearly", "@annually", "@monthly", "@weekly", "@daily", "@midnight", "@hourly",
];

fn schedule_field_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9A-Za-z*/,\-]+$").unwrap())
}

/// Check a cron schedule and normalise its spacing.
///
/// Accepts five time fields or one of the `@` macros. Field contents are
/// left for cron itself to judge.
pub fn parse_schedule(raw: &str) -> Result<String> {
    let fields: Vec<&str> = raw.split_whitespace().collect();

    match fields.as_slice() {
        [single] if single.starts_with('@') => {
            if SCHEDULE_MACROS.contains(single) {
                Ok(single.to_string())
            } else {
                Err(miette::miette!("unknown schedule macro '{}'", single))
            }
        }
        five if five.len() == 5 => {
            if let Some(bad) = five.iter().find(|f| !schedule_field_regex().is_match(f)) {
                return Err(miette::miette!("invalid schedule field '{}' in '{}'", bad, raw));
            }
            Ok(five.join(" "))
        }
        _ => Err(miette::miette!(
            "invalid schedule '{}': expected five fields (minute hour day month weekday)",
            raw
        )),
    }
}

/// Quote a word for a crontab command line.
fn crontab_word(word: &str) -> String {
    // cron turns a bare % into a newline
    let escaped = word.replace('%', "\\%");
    if escaped.chars().all(|c| c.is_ascii_alphanumeric() || "/._-+:=@,\\%".contains(c)) {
        escaped
    } else {
        format!("'{}'", escaped.replace('\'', r"'\''"))
    }
}

/// The crontab command for a job.
pub fn job_command(settings: &Settings, schedule: &str, name: &str) -> String {
    format!(
        "{} {} run {}",
        schedule,
        crontab_word(&settings.run_command.to_string_lossy()),
        name
    )
}

/// `backupctl register <plan> --schedule <cron>`
#[tracing::instrument(skip(settings, manager, reporter))]
pub async fn register(
    settings: &Settings,
    manager: &JobManager,
    reporter: &mut Reporter,
    plan_path: &Path,
    schedule: &str,
) -> Result<bool> {
    let schedule = parse_schedule(schedule)?;
    let plan = Plan::load_valid(plan_path)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    let stored = settings.plan_path(&plan.name);
    tokio::fs::create_dir_all(settings.plans_dir())
        .await
        .map_err(|e| miette::miette!("failed to create {}: {}", settings.plans_dir().display(), e))?;

    if !same_file(plan_path, &stored).await {
        tokio::fs::copy(plan_path, &stored)
            .await
            .map_err(|e| miette::miette!("failed to store plan at {}: {}", stored.display(), e))?;
        debug!(from = %plan_path.display(), to = %stored.display(), "stored plan");
    }

    let log_dir = plan.log_dir(settings);
    tokio::fs::create_dir_all(&log_dir)
        .await
        .map_err(|e| miette::miette!("failed to create log directory {}: {}", log_dir.display(), e))?;

    let exclude = settings.exclude_path(&plan.name);
    match plan.exclude_file_contents() {
        Some(text) => write_exclude_file(&exclude, &text)
            .await
            .map_err(|e| miette::miette!("failed to write {}: {}", exclude.display(), e))?,
        None => remove_file(reporter, &exclude).await,
    }

    let job = Job::new(plan.name.clone(), job_command(settings, &schedule, &plan.name));
    let outcome = manager
        .register(job)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    match outcome {
        Registration::Created => reporter.info(format!("Registered '{}' ({})", plan.name, schedule)),
        Registration::Replaced => {
            reporter.info(format!("Re-registered '{}' ({})", plan.name, schedule))
        }
    }
    reporter.info(format!("  plan: {}", stored.display()));
    reporter.info(format!("  logs: {}", log_dir.display()));
    info!(job = %plan.name, "registered");
    Ok(true)
}

async fn write_exclude_file(path: &Path, text: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, text).await?;
    debug!(path = %path.display(), "wrote exclude file");
    Ok(())
}

async fn same_file(a: &Path, b: &Path) -> bool {
    match (tokio::fs::canonicalize(a).await, tokio::fs::canonicalize(b).await) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn report_failures(reporter: &mut Reporter, report: &BatchReport) {
    for (target, error) in &report.failed {
        reporter.error(format!("{}: {}", target, error));
    }
}

/// `backupctl remove [targets..]`
#[tracing::instrument(skip(settings, manager, reporter))]
pub async fn remove(
    settings: &Settings,
    manager: &JobManager,
    reporter: &mut Reporter,
    targets: &[String],
) -> Result<bool> {
    let report = manager
        .remove(targets)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    if report.is_empty() {
        reporter.info("No jobs registered");
        return Ok(true);
    }

    for name in &report.succeeded {
        remove_file(reporter, &settings.exclude_path(name)).await;
        remove_file(reporter, &settings.plan_path(name)).await;

        let log_dir = settings.log_dir(name);
        match tokio::fs::remove_dir_all(&log_dir).await {
            Ok(()) => debug!(path = %log_dir.display(), "removed log folder"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => reporter.warn(format!("could not remove {}: {}", log_dir.display(), e)),
        }

        reporter.info(format!("Removed '{}'", name));
    }

    report_failures(reporter, &report);
    Ok(report.is_success())
}

async fn remove_file(reporter: &mut Reporter, path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => reporter.warn(format!("could not remove {}: {}", path.display(), e)),
    }
}

/// `backupctl enable|disable [targets..]`
#[tracing::instrument(skip(manager, reporter))]
pub async fn set_status(
    manager: &JobManager,
    reporter: &mut Reporter,
    targets: &[String],
    status: JobStatus,
) -> Result<bool> {
    let report = manager
        .set_status(targets, status)
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    if report.is_empty() {
        reporter.info("No jobs registered");
        return Ok(true);
    }

    let verb = match status {
        JobStatus::Enabled => "Enabled",
        JobStatus::Disabled => "Disabled",
    };
    for name in &report.succeeded {
        reporter.info(format!("{} '{}'", verb, name));
    }

    report_failures(reporter, &report);
    Ok(report.is_success())
}

/// `backupctl status [--apply]`
#[tracing::instrument(skip(settings, manager, reporter))]
pub async fn status(
    settings: &Settings,
    manager: &JobManager,
    reporter: &mut Reporter,
    apply: bool,
) -> Result<bool> {
    let (registry, audit) = manager
        .status()
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    reporter.info(format!(
        "Registry: {} job(s) in {}",
        registry.len(),
        settings.registry_path().display()
    ));
    for job in registry.values() {
        reporter.info(format!("  {:<20} {}", job.name, job.status));
    }
    reporter.info(format!("Crontab: {} managed line(s)", audit.managed_lines));

    if audit.is_consistent() {
        reporter.info("Consistency check passed");
        return Ok(true);
    }

    reporter.error("Consistency check failed");
    for finding in &audit.findings {
        reporter.info(format!("  - {}", finding));
    }
    reporter.info(
        "Repairing writes every registered job into the crontab. Unrelated entries are kept; \
         backupctl entries without a registered job are removed.",
    );

    if !apply {
        let repair = reporter
            .confirm("Repair the crontab now?")
            .map_err(|e| miette::miette!("failed to read answer: {}", e))?;
        if !repair {
            return Ok(false);
        }
    }

    let after = manager.repair().await.map_err(|e| miette::miette!("{}", e))?;
    if after.is_consistent() {
        reporter.info("Crontab repaired");
        Ok(true)
    } else {
        for finding in &after.findings {
            reporter.error(finding.to_string());
        }
        Ok(false)
    }
}
