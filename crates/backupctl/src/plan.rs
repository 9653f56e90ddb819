//! Plan documents: what a job runs, where it logs, who hears about it.

use std::path::{Path, PathBuf};

use backupctl_notify::{Channel, NotifyError, validate_channels};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::settings::Settings;

/// Errors loading or checking a plan document.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("cannot read plan {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed plan {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid plan: {0}")]
    Invalid(String),

    #[error(transparent)]
    Notification(#[from] NotifyError),
}

/// Where run logs go: a directory, or a directory plus retention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogConfig {
    Dir(PathBuf),
    Detailed {
        path: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_files: Option<usize>,
    },
}

/// A job's plan as stored in `<home>/plans/<name>-plan.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<LogConfig>,
    /// The transfer invocation, program first.
    pub command: Vec<String>,
    /// rsync exclude patterns, one per line of the job's exclude file.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub notification: Vec<Channel>,
}

impl Plan {
    /// Read and parse a plan without checking it.
    pub async fn load(path: &Path) -> Result<Self, PlanError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| PlanError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        serde_json::from_str(&raw).map_err(|source| PlanError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read, parse and validate a plan.
    pub async fn load_valid(path: &Path) -> Result<Self, PlanError> {
        let plan = Self::load(path).await?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        backupctl_scheduler::validate_name(&self.name)
            .map_err(|e| PlanError::Invalid(e.to_string()))?;

        match self.command.first() {
            None => {
                return Err(PlanError::Invalid(format!(
                    "plan '{}' has an empty command",
                    self.name
                )));
            }
            Some(program) if program.trim().is_empty() => {
                return Err(PlanError::Invalid(format!(
                    "plan '{}' has no program to run",
                    self.name
                )));
            }
            Some(_) => {}
        }

        match &self.log {
            Some(LogConfig::Dir(path)) | Some(LogConfig::Detailed { path, .. })
                if path.as_os_str().is_empty() =>
            {
                return Err(PlanError::Invalid("log path cannot be empty".to_string()));
            }
            Some(LogConfig::Detailed {
                max_files: Some(0), ..
            }) => {
                return Err(PlanError::Invalid(
                    "log.max_files must be at least 1".to_string(),
                ));
            }
            _ => {}
        }

        if let Some(pattern) = self.exclude.iter().find(|p| p.contains(['\n', '\r'])) {
            return Err(PlanError::Invalid(format!(
                "exclude pattern {:?} spans lines",
                pattern
            )));
        }

        validate_channels(&self.notification)?;
        Ok(())
    }

    /// Directory the job's run logs go to.
    pub fn log_dir(&self, settings: &Settings) -> PathBuf {
        match &self.log {
            Some(LogConfig::Dir(path)) | Some(LogConfig::Detailed { path, .. }) => path.clone(),
            None => settings.log_dir(&self.name),
        }
    }

    /// How many log files to keep, if limited.
    pub fn max_log_files(&self) -> Option<usize> {
        match &self.log {
            Some(LogConfig::Detailed { max_files, .. }) => *max_files,
            _ => None,
        }
    }

    /// The command as one line, for display.
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }

    /// Contents of the job's exclude file, or `None` without patterns.
    pub fn exclude_file_contents(&self) -> Option<String> {
        if self.exclude.is_empty() {
            return None;
        }
        let mut text = self.exclude.join("\n");
        text.push('\n');
        Some(text)
    }

    /// The command to execute. Extra flags go before the last two
    /// arguments (source and destination).
    pub fn invocation(&self, exclude_file: Option<&Path>, dry_run: bool) -> Vec<String> {
        let mut flags = Vec::new();
        if let Some(path) = exclude_file {
            flags.push(format!("--exclude-from={}", path.display()));
        }
        if dry_run {
            flags.push("--dry-run".to_string());
        }

        let mut command = self.command.clone();
        let at = command.len().saturating_sub(2);
        command.splice(at..at, flags);
        command
    }
}
