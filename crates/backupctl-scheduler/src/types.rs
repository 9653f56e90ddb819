//! Registry types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::SchedulerError;

/// Prefix of the trailing token that marks a crontab line as ours.
pub const TAG_PREFIX: &str = "#backupctl:";

/// Prefix written in front of the line of a disabled job.
pub const DISABLED_PREFIX: &str = "# ";

/// All registered jobs keyed by name. Iteration is name-sorted, which
/// gives reconciliation its deterministic order.
pub type Registry = BTreeMap<String, Job>;

/// A registered backup job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Unique, stable key.
    pub name: String,
    /// Full crontab invocation (schedule fields plus command).
    pub cmd: String,
    /// Whether the crontab line is live or commented out.
    pub status: JobStatus,
}

/// Whether a job's crontab line is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum JobStatus {
    #[default]
    Enabled,
    Disabled,
}

impl JobStatus {
    /// The registry spelling of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Enabled => "ENABLED",
            JobStatus::Disabled => "DISABLED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ENABLED" => Ok(JobStatus::Enabled),
            "DISABLED" => Ok(JobStatus::Disabled),
            other => Err(format!(
                "unknown status '{}', expected ENABLED or DISABLED",
                other
            )),
        }
    }
}

impl Job {
    /// Create a new enabled job.
    pub fn new(name: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cmd: cmd.into(),
            status: JobStatus::Enabled,
        }
    }

    /// Same job with the given status.
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.status == JobStatus::Enabled
    }

    /// The correlation tag for this job.
    pub fn tag(&self) -> String {
        tag_for(&self.name)
    }

    /// The one crontab line this job should own.
    pub fn render_line(&self) -> String {
        let prefix = match self.status {
            JobStatus::Enabled => "",
            JobStatus::Disabled => DISABLED_PREFIX,
        };
        format!("{}{} {}", prefix, self.cmd, self.tag())
    }

    /// Check that the job can be stored in the registry and the table.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        validate_name(&self.name)?;

        if self.cmd.trim().is_empty() {
            return Err(SchedulerError::InvalidJob(format!(
                "job '{}' has an empty command",
                self.name
            )));
        }

        if self.cmd.contains(['\n', '\r']) {
            return Err(SchedulerError::InvalidJob(format!(
                "job '{}' command spans multiple lines",
                self.name
            )));
        }

        Ok(())
    }
}

/// The tag token for a job name.
pub fn tag_for(name: &str) -> String {
    format!("{}{}", TAG_PREFIX, name)
}

/// If the line is managed, the job name carried by its tag.
///
/// Only the last whitespace-separated token counts, so a tag-like string
/// in the middle of a foreign command does not make the line ours.
pub fn managed_name(line: &str) -> Option<&str> {
    line.split_whitespace()
        .next_back()?
        .strip_prefix(TAG_PREFIX)
        .filter(|name| !name.is_empty())
}

/// Validate a job name.
///
/// Names end up as a single registry token and inside the tag, so they are
/// restricted to ASCII alphanumerics plus `_`, `-` and `.`.
pub fn validate_name(name: &str) -> Result<(), SchedulerError> {
    if name.is_empty() {
        return Err(SchedulerError::InvalidJob(
            "job name cannot be empty".to_string(),
        ));
    }

    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err(SchedulerError::InvalidJob(format!(
            "job name '{}' must start with a letter or digit",
            name
        )));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(SchedulerError::InvalidJob(format!(
            "job name '{}' may only contain letters, digits, '_', '-' and '.'",
            name
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_render_enabled_line() {
        let job = Job::new("a", "0 3 * * * run a");
        assert_eq!(job.render_line(), "0 3 * * * run a #backupctl:a");
    }

    #[test]
    fn test_render_disabled_line() {
        let job = Job::new("a", "0 3 * * * run a").with_status(JobStatus::Disabled);
        assert_eq!(job.render_line(), "# 0 3 * * * run a #backupctl:a");
    }

    #[test]
    fn test_status_parse_is_case_insensitive() {
        assert_eq!("enabled".parse::<JobStatus>(), Ok(JobStatus::Enabled));
        assert_eq!("Disabled".parse::<JobStatus>(), Ok(JobStatus::Disabled));
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_managed_name() {
        assert_eq!(managed_name("0 3 * * * run a #backupctl:a"), Some("a"));
        assert_eq!(managed_name("# 0 3 * * * run a #backupctl:docs"), Some("docs"));
        assert_eq!(managed_name("0 3 * * * run a #backupctl:a   "), Some("a"));
        assert_eq!(managed_name("0 3 * * * /usr/bin/foreign"), None);
        assert_eq!(managed_name("#backupctl:a 0 3 * * * foreign"), None);
        assert_eq!(managed_name("0 3 * * * x #backupctl:"), None);
        assert_eq!(managed_name(""), None);
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("docs").is_ok());
        assert!(validate_name("home-2.daily_x").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("-docs").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("semi;colon").is_err());
    }

    #[test]
    fn test_validate_job_command() {
        assert!(Job::new("a", "0 3 * * * run a").validate().is_ok());
        assert!(Job::new("a", "   ").validate().is_err());
        assert!(Job::new("a", "0 3 * * * run\nrm -rf").validate().is_err());
    }

    proptest! {
        #[test]
        fn rendered_line_carries_own_tag(
            name in "[a-z0-9][a-z0-9_.-]{0,20}",
            cmd in "[0-9*]{1,2} [0-9*]{1,2} \\* \\* \\* [a-z/ ]{1,30}[a-z]",
            disabled in proptest::bool::ANY,
        ) {
            let status = if disabled { JobStatus::Disabled } else { JobStatus::Enabled };
            let job = Job::new(name.clone(), cmd).with_status(status);
            let line = job.render_line();

            prop_assert_eq!(managed_name(&line), Some(name.as_str()));
            prop_assert_eq!(line.starts_with(DISABLED_PREFIX), disabled);
        }
    }
}
