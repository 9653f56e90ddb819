//! Error types for the scheduler.

use thiserror::Error;

/// Errors that can occur in registry and table operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Malformed registry content.
    #[error("invalid registry: {0}")]
    Config(String),

    /// The host table program failed. `stderr` is passed through untouched.
    #[error("`{command}` failed: {stderr}")]
    ExternalTool { command: String, stderr: String },

    /// Job not found.
    #[error("job not found: {0}")]
    NotFound(String),

    /// Invalid job definition.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// The table lock could not be taken.
    #[error("could not lock crontab: {0}")]
    Lock(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
