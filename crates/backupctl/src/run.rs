//! `backupctl run`: execute a job's transfer, log it, and notify.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use backupctl_notify::{Dispatcher, EmailTransport, Event, Outcome, WebhookTransport};
use backupctl_scheduler::JobManager;
use chrono::{DateTime, Local};
use miette::Result;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::plan::Plan;
use crate::reporter::Reporter;
use crate::settings::Settings;

/// Lines of the command's stderr quoted in the summary.
const STDERR_TAIL_LINES: usize = 20;

/// Switches of one run.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub dry_run: bool,
    pub notify: bool,
    pub log: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            notify: true,
            log: true,
        }
    }
}

/// What one execution of the command produced.
#[derive(Debug)]
pub struct Execution {
    pub command: Vec<String>,
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
    /// Exit code, `None` if the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Set when the program could not be started at all.
    pub spawn_error: Option<String>,
    pub stdout: String,
    pub stderr: String,
}

impl Execution {
    pub fn outcome(&self) -> Outcome {
        if self.spawn_error.is_none() && self.exit_code == Some(0) {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }

    fn exit_label(&self) -> String {
        match (&self.spawn_error, self.exit_code) {
            (Some(_), _) => "not started".to_string(),
            (None, Some(code)) => code.to_string(),
            (None, None) => "killed by signal".to_string(),
        }
    }

    fn duration_label(&self) -> String {
        let millis = (self.finished - self.started).num_milliseconds().max(0);
        format!("{}.{:03}s", millis / 1000, millis % 1000)
    }

    /// Full record written to the run log.
    pub fn log_text(&self) -> String {
        let mut text = format!(
            "Started  : {}\nCommand  : {}\n",
            self.started.to_rfc3339(),
            self.command.join(" ")
        );
        if let Some(error) = &self.spawn_error {
            text.push_str(&format!("Error    : {}\n", error));
        }
        text.push_str("\n----- STDOUT -----\n");
        push_block(&mut text, &self.stdout);
        text.push_str("----- STDERR -----\n");
        push_block(&mut text, &self.stderr);
        text.push_str(&format!(
            "----- END -----\nFinished : {}\nDuration : {}\nExit code: {}\n",
            self.finished.to_rfc3339(),
            self.duration_label(),
            self.exit_label()
        ));
        text
    }

    /// Short report for notifications and the terminal.
    pub fn summary(&self, log_file: Option<&Path>) -> String {
        let verdict = match self.outcome() {
            Outcome::Success => "SUCCESS",
            Outcome::Failure => "FAILED",
        };
        let mut text = format!(
            "{}\nCommand : {}\nStarted : {}\nFinished: {}\nDuration: {}\nExit    : {}\nLog file: {}\n",
            verdict,
            self.command.join(" "),
            self.started.format("%Y-%m-%d %H:%M:%S"),
            self.finished.format("%Y-%m-%d %H:%M:%S"),
            self.duration_label(),
            self.exit_label(),
            log_file
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".to_string()),
        );

        if let Some(error) = &self.spawn_error {
            text.push_str(&format!("\nError: {}\n", error));
        }

        let tail = tail_lines(&self.stderr, STDERR_TAIL_LINES);
        if !tail.is_empty() {
            text.push_str("\n--- STDERR (tail) ---\n");
            text.push_str(&tail);
            text.push('\n');
        }
        text
    }
}

fn push_block(text: &mut String, block: &str) {
    text.push_str(block);
    if !block.is_empty() && !block.ends_with('\n') {
        text.push('\n');
    }
}

fn tail_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(count)..].join("\n")
}

/// Run `command` to completion, capturing its output.
pub async fn execute(command: &[String]) -> Execution {
    let started = Local::now();
    let mut execution = Execution {
        command: command.to_vec(),
        started,
        finished: started,
        exit_code: None,
        spawn_error: None,
        stdout: String::new(),
        stderr: String::new(),
    };

    let Some((program, args)) = command.split_first() else {
        execution.spawn_error = Some("empty command".to_string());
        return execution;
    };

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await;

    execution.finished = Local::now();
    match output {
        Ok(output) => {
            execution.exit_code = output.status.code();
            execution.stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            execution.stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        }
        Err(e) => {
            warn!(program = %program, error = %e, "could not start backup command");
            execution.spawn_error = Some(format!("could not start '{}': {}", program, e));
        }
    }
    execution
}

/// Log file name for a run of `job` started at `started`.
pub fn log_file_name(job: &str, started: &DateTime<Local>) -> String {
    format!("{}-{}.log", job, started.format("%Y%m%d-%H%M%S"))
}

/// `YYYYmmdd-HHMMSS`
fn is_log_stamp(stamp: &str) -> bool {
    let bytes = stamp.as_bytes();
    bytes.len() == 15
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| if i == 8 { *b == b'-' } else { b.is_ascii_digit() })
}

/// Run logs of `job` in `dir`, oldest first.
pub async fn list_logs(dir: &Path, job: &str) -> std::io::Result<Vec<PathBuf>> {
    let prefix = format!("{}-", job);
    let mut logs = Vec::new();

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(logs),
        Err(e) => return Err(e),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        let stamped = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(".log"))
            .is_some_and(is_log_stamp);
        if stamped && entry.file_type().await?.is_file() {
            logs.push(entry.path());
        }
    }

    // Timestamps in the names sort chronologically
    logs.sort();
    Ok(logs)
}

/// Delete the oldest run logs until at most `keep` remain.
pub async fn prune_logs(dir: &Path, job: &str, keep: usize) -> std::io::Result<usize> {
    let logs = list_logs(dir, job).await?;
    let excess = logs.len().saturating_sub(keep);
    for path in &logs[..excess] {
        tokio::fs::remove_file(path).await?;
        debug!(path = %path.display(), "pruned run log");
    }
    Ok(excess)
}

/// `backupctl run <target>`
///
/// Returns `Ok(false)` when the backup or its email notification failed.
#[tracing::instrument(skip(settings, manager, reporter, dispatcher))]
pub async fn run<W: WebhookTransport, E: EmailTransport>(
    settings: &Settings,
    manager: &JobManager,
    reporter: &mut Reporter,
    dispatcher: &Dispatcher<W, E>,
    target: &str,
    options: RunOptions,
) -> Result<bool> {
    let registry = manager.registry().await.map_err(|e| miette::miette!("{}", e))?;
    if !registry.contains_key(target) {
        reporter.warn(format!("'{}' is not a registered job, nothing to run", target));
        return Ok(true);
    }

    let plan = Plan::load_valid(&settings.plan_path(target))
        .await
        .map_err(|e| miette::miette!("{}", e))?;

    let exclude_file = (!plan.exclude.is_empty()).then(|| settings.exclude_path(&plan.name));
    let command = plan.invocation(exclude_file.as_deref(), options.dry_run);

    info!(job = %plan.name, dry_run = options.dry_run, "starting backup");
    let execution = execute(&command).await;
    let outcome = execution.outcome();
    info!(job = %plan.name, outcome = %outcome, exit = %execution.exit_label(), "backup finished");

    let log_file = if options.log {
        write_log(reporter, &plan, settings, &execution).await
    } else {
        None
    };

    let event = Event::new(plan.name.clone(), outcome, execution.summary(log_file.as_deref()))
        .at(execution.finished);

    let mut ok = outcome == Outcome::Success;

    if options.notify && !plan.notification.is_empty() {
        match dispatcher
            .dispatch(&event, &plan.notification, log_file.as_deref())
            .await
        {
            Ok(report) => {
                for (name, error) in report.failures() {
                    reporter.warn(format!("notification '{}' failed: {}", name, error));
                }
            }
            Err(e) => {
                reporter.error(format!("email notification failed: {}", e));
                ok = false;
            }
        }
    }

    reporter.info(event.content());
    Ok(ok)
}

async fn write_log(
    reporter: &mut Reporter,
    plan: &Plan,
    settings: &Settings,
    execution: &Execution,
) -> Option<PathBuf> {
    let dir = plan.log_dir(settings);
    let path = dir.join(log_file_name(&plan.name, &execution.started));

    let written = async {
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(&path, execution.log_text()).await
    }
    .await;

    if let Err(e) = written {
        reporter.warn(format!("could not write run log {}: {}", path.display(), e));
        return None;
    }

    if let Some(keep) = plan.max_log_files() {
        match prune_logs(&dir, &plan.name, keep).await {
            Ok(0) => {}
            Ok(pruned) => debug!(pruned, keep, "applied log retention"),
            Err(e) => reporter.warn(format!("could not prune logs in {}: {}", dir.display(), e)),
        }
    }

    Some(path)
}
