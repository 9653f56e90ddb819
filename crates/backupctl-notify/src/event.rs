//! Completed-run events.

use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// How a job run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The result of one job run, handed to the dispatcher exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub job: String,
    pub outcome: Outcome,
    pub summary: String,
    /// When the run finished.
    pub finished_at: DateTime<Local>,
}

impl Event {
    pub fn new(job: impl Into<String>, outcome: Outcome, summary: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            outcome,
            summary: summary.into(),
            finished_at: Local::now(),
        }
    }

    /// Override the finish time.
    pub fn at(mut self, finished_at: DateTime<Local>) -> Self {
        self.finished_at = finished_at;
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    /// One-line subject used for emails and webhook messages.
    pub fn subject(&self) -> String {
        format!(
            "[Backup: {}] {} ({})",
            self.job,
            if self.is_success() { "OK" } else { "FAILED" },
            self.finished_at.format("%Y-%m-%d %H:%M")
        )
    }

    /// Subject followed by the summary.
    pub fn content(&self) -> String {
        format!("{}\n{}", self.subject(), self.summary)
    }
}
