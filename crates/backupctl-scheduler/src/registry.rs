//! Durable registry file.
//!
//! One job per line: `<name> <cmd...> <STATUS>`. The command is everything
//! between the name token and the status token, kept verbatim.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::{Job, JobStatus, Registry, SchedulerError};

/// The registry file on disk.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the registry. A missing file is an empty registry.
    pub async fn load(&self) -> Result<Registry, SchedulerError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Registry::new()),
            Err(e) => return Err(e.into()),
        };

        let registry = parse_registry(&content).map_err(|e| match e {
            SchedulerError::Config(msg) => {
                SchedulerError::Config(format!("{}: {}", self.path.display(), msg))
            }
            other => other,
        })?;

        debug!(path = %self.path.display(), jobs = registry.len(), "loaded registry");
        Ok(registry)
    }

    /// Replace the registry file with the given jobs.
    ///
    /// Written to a sibling temp file first, then renamed over the target.
    pub async fn write(&self, registry: &Registry) -> Result<(), SchedulerError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let content = render_registry(registry);

        let temp_path = self.path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &self.path).await?;

        debug!(path = %self.path.display(), jobs = registry.len(), "wrote registry");
        Ok(())
    }
}

/// Parse registry content.
pub fn parse_registry(content: &str) -> Result<Registry, SchedulerError> {
    let mut registry = Registry::new();

    for (idx, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        let job = parse_line(line)
            .map_err(|msg| SchedulerError::Config(format!("line {}: {}", idx + 1, msg)))?;

        if registry.contains_key(&job.name) {
            return Err(SchedulerError::Config(format!(
                "line {}: duplicate job '{}'",
                idx + 1,
                job.name
            )));
        }

        registry.insert(job.name.clone(), job);
    }

    Ok(registry)
}

fn parse_line(line: &str) -> Result<Job, String> {
    let line = line.trim();

    let (name, rest) = line
        .split_once(char::is_whitespace)
        .ok_or_else(|| format!("expected '<name> <command> <STATUS>', got '{}'", line))?;

    let (cmd, status) = rest
        .trim_start()
        .rsplit_once(char::is_whitespace)
        .ok_or_else(|| format!("job '{}' has no command", name))?;

    let cmd = cmd.trim();
    if cmd.is_empty() {
        return Err(format!("job '{}' has no command", name));
    }

    let status: JobStatus = status.parse()?;

    Ok(Job {
        name: name.to_string(),
        cmd: cmd.to_string(),
        status,
    })
}

/// Serialize the registry, one line per job in name order.
pub fn render_registry(registry: &Registry) -> String {
    registry
        .values()
        .map(|job| format!("{} {} {}\n", job.name, job.cmd, job.status))
        .collect()
}
