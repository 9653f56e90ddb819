//! `backupctl inspect` and `backupctl validate`.

use std::path::{Path, PathBuf};

use backupctl_scheduler::{Job, JobManager};
use miette::Result;

use crate::plan::Plan;
use crate::reporter::Reporter;
use crate::run::list_logs;
use crate::settings::Settings;

/// The schedule part of a job's crontab command.
pub fn schedule_of(job: &Job) -> Option<String> {
    let fields: Vec<&str> = job.cmd.split_whitespace().collect();
    match fields.first() {
        Some(first) if first.starts_with('@') => Some(first.to_string()),
        _ if fields.len() > 5 => Some(fields[..5].join(" ")),
        _ => None,
    }
}

/// Start time and exit code recorded in a run log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LastRun {
    pub log: PathBuf,
    pub started: Option<String>,
    pub exit_code: Option<String>,
}

/// Read the newest run log of `job` in `dir`, if any.
pub async fn last_run(dir: &Path, job: &str) -> std::io::Result<Option<LastRun>> {
    let Some(log) = list_logs(dir, job).await?.pop() else {
        return Ok(None);
    };
    let text = tokio::fs::read_to_string(&log).await?;

    let field = |key: &str| {
        text.lines()
            .find_map(|line| line.strip_prefix(key))
            .map(|value| value.trim_start_matches([' ', ':']).trim().to_string())
    };

    Ok(Some(LastRun {
        started: field("Started"),
        exit_code: field("Exit code"),
        log,
    }))
}

/// `backupctl inspect [targets..]`
#[tracing::instrument(skip(settings, manager, reporter))]
pub async fn inspect(
    settings: &Settings,
    manager: &JobManager,
    reporter: &mut Reporter,
    targets: &[String],
) -> Result<bool> {
    let registry = manager.registry().await.map_err(|e| miette::miette!("{}", e))?;
    if registry.is_empty() {
        reporter.info("No jobs registered");
        return Ok(true);
    }

    let names: Vec<String> = if targets.is_empty() {
        registry.keys().cloned().collect()
    } else {
        targets.to_vec()
    };

    let mut ok = true;
    for (i, name) in names.iter().enumerate() {
        let Some(job) = registry.get(name) else {
            reporter.error(format!("job not found: {}", name));
            ok = false;
            continue;
        };

        if i > 0 {
            reporter.info("");
        }
        reporter.info(format!("Name      : {}", job.name));
        reporter.info(format!("Status    : {}", job.status));
        reporter.info(format!(
            "Schedule  : {}",
            schedule_of(job).unwrap_or_else(|| "unknown".to_string())
        ));

        let plan = match Plan::load(&settings.plan_path(name)).await {
            Ok(plan) => plan,
            Err(e) => {
                reporter.error(e.to_string());
                ok = false;
                continue;
            }
        };

        let log_dir = plan.log_dir(settings);
        reporter.info(format!("Log Path  : {}", log_dir.display()));
        reporter.info(format!("Command   : {}", plan.command_line()));
        if !plan.notification.is_empty() {
            let labels: Vec<String> = plan.notification.iter().map(|c| c.label()).collect();
            reporter.info(format!("Notify    : {}", labels.join(", ")));
        }

        match last_run(&log_dir, name).await {
            Ok(Some(run)) => {
                reporter.info(format!(
                    "Last Run  : {}",
                    run.started.as_deref().unwrap_or("unknown")
                ));
                reporter.info(format!(
                    "Exit Code : {}",
                    run.exit_code.as_deref().unwrap_or("unknown")
                ));
                reporter.info(format!("Last Log  : {}", run.log.display()));
            }
            Ok(None) => reporter.info("Last Run  : never"),
            Err(e) => reporter.warn(format!("could not read logs in {}: {}", log_dir.display(), e)),
        }
    }

    Ok(ok)
}

/// `backupctl validate <plan>`
#[tracing::instrument(skip(reporter))]
pub async fn validate(reporter: &mut Reporter, path: &Path) -> Result<bool> {
    match Plan::load_valid(path).await {
        Ok(plan) => {
            reporter.info(format!(
                "Plan '{}' is valid ({} notification channel(s))",
                plan.name,
                plan.notification.len()
            ));
            Ok(true)
        }
        Err(e) => {
            reporter.error(e.to_string());
            Ok(false)
        }
    }
}
