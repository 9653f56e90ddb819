//! Access to the host's periodic-job table.
//!
//! The table is treated as an opaque sequence of lines: read it whole,
//! replace it whole. Parsing of cron syntax never happens here.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

use crate::SchedulerError;

/// A whole-table accessor.
#[async_trait]
pub trait SchedulerTable: Send + Sync {
    /// Current lines, in order. Empty if no table exists yet.
    async fn read(&self) -> Result<Vec<String>, SchedulerError>;

    /// Replace the table with `lines` in a single call.
    async fn write(&self, lines: &[String]) -> Result<(), SchedulerError>;
}

/// The user's crontab, edited through the `crontab` program.
#[derive(Debug, Clone)]
pub struct CrontabTable {
    program: PathBuf,
}

impl Default for CrontabTable {
    fn default() -> Self {
        Self::new("crontab")
    }
}

impl CrontabTable {
    /// Use a specific `crontab`-compatible program.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn describe(&self, arg: &str) -> String {
        format!("{} {}", self.program.display(), arg)
    }
}

#[async_trait]
impl SchedulerTable for CrontabTable {
    async fn read(&self) -> Result<Vec<String>, SchedulerError> {
        let output = Command::new(&self.program)
            .arg("-l")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SchedulerError::ExternalTool {
                command: self.describe("-l"),
                stderr: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);

        // `crontab -l` exits 1 with nothing on stdout when the user has no table yet
        let no_table = output.status.code() == Some(1) && stdout.is_empty();
        if !output.status.success() && !no_table {
            return Err(SchedulerError::ExternalTool {
                command: self.describe("-l"),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let lines: Vec<String> = stdout.lines().map(str::to_string).collect();
        debug!(lines = lines.len(), no_table, "read crontab");
        Ok(lines)
    }

    async fn write(&self, lines: &[String]) -> Result<(), SchedulerError> {
        let tool_error = |e: std::io::Error| SchedulerError::ExternalTool {
            command: self.describe("-"),
            stderr: e.to_string(),
        };

        let mut payload = lines.join("\n").trim_end_matches('\n').to_string();
        payload.push('\n');

        let mut child = Command::new(&self.program)
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(tool_error)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload.as_bytes())
                .await
                .map_err(tool_error)?;
            // Dropping stdin closes the pipe so the program sees EOF
        }

        let output = child.wait_with_output().await.map_err(tool_error)?;
        if !output.status.success() {
            return Err(SchedulerError::ExternalTool {
                command: self.describe("-"),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        debug!(lines = lines.len(), "wrote crontab");
        Ok(())
    }
}

/// An in-process table, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryTable {
    lines: Mutex<Vec<String>>,
    writes: Mutex<usize>,
    fail_writes: Mutex<Option<String>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with existing lines.
    pub fn with_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: Mutex::new(lines.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Snapshot of the current lines.
    pub async fn lines(&self) -> Vec<String> {
        self.lines.lock().await.clone()
    }

    /// Number of successful writes so far.
    pub async fn write_count(&self) -> usize {
        *self.writes.lock().await
    }

    /// Make every following write fail with `stderr`, or succeed again with `None`.
    pub async fn fail_writes(&self, stderr: Option<String>) {
        *self.fail_writes.lock().await = stderr;
    }
}

#[async_trait]
impl SchedulerTable for MemoryTable {
    async fn read(&self) -> Result<Vec<String>, SchedulerError> {
        Ok(self.lines().await)
    }

    async fn write(&self, lines: &[String]) -> Result<(), SchedulerError> {
        if let Some(stderr) = self.fail_writes.lock().await.clone() {
            return Err(SchedulerError::ExternalTool {
                command: "memory -".to_string(),
                stderr,
            });
        }

        *self.lines.lock().await = lines.to_vec();
        *self.writes.lock().await += 1;
        Ok(())
    }
}
