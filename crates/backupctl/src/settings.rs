//! Filesystem layout and host integration settings.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use backupctl_scheduler::{CrontabTable, JobManager, RegistryStore, SchedulerTable};

/// Registry file name inside the home directory.
pub const REGISTRY_FILE: &str = "REGISTERED_JOBS";

/// Suffix of stored plan documents.
pub const PLAN_SUFFIX: &str = "-plan.json";

/// Everything derived from the global CLI options.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root of all backupctl state, `~/.backups` by default.
    pub home: PathBuf,
    /// Program used to read and install the crontab.
    pub crontab: PathBuf,
    /// Command placed in scheduled lines to run a job.
    pub run_command: PathBuf,
    /// How long to wait for another backupctl holding the table lock.
    pub lock_timeout: Duration,
}

impl Settings {
    pub fn new(
        home: Option<PathBuf>,
        crontab: PathBuf,
        run_command: Option<PathBuf>,
        lock_timeout: Duration,
    ) -> miette::Result<Self> {
        let home = match home {
            Some(home) => home,
            None => dirs::home_dir()
                .map(|h| h.join(".backups"))
                .ok_or_else(|| miette::miette!("cannot determine the home directory; pass --home"))?,
        };

        let run_command = match run_command {
            Some(cmd) => cmd,
            None => std::env::current_exe()
                .map_err(|e| miette::miette!("cannot locate the backupctl executable: {}", e))?,
        };

        Ok(Self {
            home,
            crontab,
            run_command,
            lock_timeout,
        })
    }

    pub fn registry_path(&self) -> PathBuf {
        self.home.join(REGISTRY_FILE)
    }

    pub fn plans_dir(&self) -> PathBuf {
        self.home.join("plans")
    }

    pub fn plan_path(&self, job: &str) -> PathBuf {
        self.plans_dir().join(format!("{}{}", job, PLAN_SUFFIX))
    }

    /// Default log directory of a job.
    pub fn log_dir(&self, job: &str) -> PathBuf {
        self.home.join("log").join(job)
    }

    pub fn exclude_path(&self, job: &str) -> PathBuf {
        self.home.join("rsync-exclude").join(format!("{}.exclude", job))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.home.join(".table.lock")
    }

    /// The host crontab.
    pub fn table(&self) -> Arc<dyn SchedulerTable> {
        Arc::new(CrontabTable::new(&self.crontab))
    }

    /// A manager over this home's registry and `table`.
    pub fn manager_with(&self, table: Arc<dyn SchedulerTable>) -> JobManager {
        JobManager::new(RegistryStore::new(self.registry_path()), table)
            .with_lock(self.lock_path(), self.lock_timeout)
    }

    /// A manager over this home's registry and the host crontab.
    pub fn manager(&self) -> JobManager {
        self.manager_with(self.table())
    }
}
