//! Administrative operations over the registry and the table.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::{
    AuditReport, Job, JobStatus, Registry, RegistryStore, SchedulerError, SchedulerTable,
    TableLock, apply, check, repair,
};

/// Per-target outcome of a batch command.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Targets that were changed.
    pub succeeded: Vec<String>,
    /// Targets that could not be processed, with the reason.
    pub failed: Vec<(String, SchedulerError)>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty() && self.failed.is_empty()
    }
}

/// What `register` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    Replaced,
}

/// Registry-first administration.
///
/// Every mutation writes the full registry and then reconciles the table,
/// both under the table lock when one is configured.
pub struct JobManager {
    store: RegistryStore,
    table: Arc<dyn SchedulerTable>,
    lock: Option<(PathBuf, Duration)>,
}

impl JobManager {
    /// Create a manager without locking.
    pub fn new(store: RegistryStore, table: Arc<dyn SchedulerTable>) -> Self {
        Self {
            store,
            table,
            lock: None,
        }
    }

    /// Serialize mutations through a lock file.
    pub fn with_lock(mut self, path: impl Into<PathBuf>, timeout: Duration) -> Self {
        self.lock = Some((path.into(), timeout));
        self
    }

    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    pub fn table(&self) -> &dyn SchedulerTable {
        self.table.as_ref()
    }

    /// Current registry contents.
    pub async fn registry(&self) -> Result<Registry, SchedulerError> {
        self.store.load().await
    }

    async fn lock(&self) -> Result<Option<TableLock>, SchedulerError> {
        match &self.lock {
            Some((path, timeout)) => Ok(Some(TableLock::acquire(path, *timeout).await?)),
            None => Ok(None),
        }
    }

    async fn commit(&self, registry: &Registry) -> Result<(), SchedulerError> {
        self.store.write(registry).await?;
        apply(self.table.as_ref(), registry).await?;
        Ok(())
    }

    /// Add a job, or replace the job with the same name.
    #[tracing::instrument(skip(self, job), fields(job = %job.name))]
    pub async fn register(&self, job: Job) -> Result<Registration, SchedulerError> {
        job.validate()?;

        let _lock = self.lock().await?;
        let mut registry = self.store.load().await?;

        let outcome = match registry.insert(job.name.clone(), job) {
            Some(_) => Registration::Replaced,
            None => Registration::Created,
        };

        self.commit(&registry).await?;
        info!(?outcome, "registered job");
        Ok(outcome)
    }

    /// Remove jobs. An empty target list means every registered job.
    #[tracing::instrument(skip(self))]
    pub async fn remove(&self, targets: &[String]) -> Result<BatchReport, SchedulerError> {
        let _lock = self.lock().await?;
        let mut registry = self.store.load().await?;
        let targets = resolve_targets(targets, &registry);

        let mut report = BatchReport::default();
        for target in targets {
            match registry.remove(&target) {
                Some(_) => report.succeeded.push(target),
                None => {
                    warn!(job = %target, "not in the registry");
                    report
                        .failed
                        .push((target.clone(), SchedulerError::NotFound(target)));
                }
            }
        }

        if !report.succeeded.is_empty() {
            self.commit(&registry).await?;
            info!(removed = report.succeeded.len(), "removed jobs");
        }

        Ok(report)
    }

    /// Enable or disable jobs. An empty target list means every registered job.
    #[tracing::instrument(skip(self))]
    pub async fn set_status(
        &self,
        targets: &[String],
        status: JobStatus,
    ) -> Result<BatchReport, SchedulerError> {
        let _lock = self.lock().await?;
        let mut registry = self.store.load().await?;
        let targets = resolve_targets(targets, &registry);

        let mut report = BatchReport::default();
        for target in targets {
            match registry.get_mut(&target) {
                Some(job) => {
                    job.status = status;
                    report.succeeded.push(target);
                }
                None => {
                    warn!(job = %target, "not in the registry");
                    report
                        .failed
                        .push((target.clone(), SchedulerError::NotFound(target)));
                }
            }
        }

        if !report.succeeded.is_empty() {
            self.commit(&registry).await?;
            info!(%status, changed = report.succeeded.len(), "updated job status");
        }

        Ok(report)
    }

    /// Audit the table against the registry without changing anything.
    pub async fn status(&self) -> Result<(Registry, AuditReport), SchedulerError> {
        let registry = self.store.load().await?;
        let lines = self.table.read().await?;
        let report = check(&registry, &lines);
        Ok((registry, report))
    }

    /// Rewrite the table from the registry and audit it again.
    #[tracing::instrument(skip(self))]
    pub async fn repair(&self) -> Result<AuditReport, SchedulerError> {
        let _lock = self.lock().await?;
        let registry = self.store.load().await?;
        repair(self.table.as_ref(), &registry).await
    }
}

fn resolve_targets(targets: &[String], registry: &Registry) -> Vec<String> {
    if targets.is_empty() {
        registry.keys().cloned().collect()
    } else {
        targets.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryTable;
    use pretty_assertions::assert_eq;
    use tempfile::{TempDir, tempdir};

    fn setup(lines: &[&str]) -> (TempDir, Arc<MemoryTable>, JobManager) {
        let dir = tempdir().unwrap();
        let table = Arc::new(MemoryTable::with_lines(lines.iter().copied()));
        let manager = JobManager::new(
            RegistryStore::new(dir.path().join("REGISTERED_JOBS")),
            table.clone(),
        )
        .with_lock(dir.path().join(".table.lock"), Duration::from_secs(1));
        (dir, table, manager)
    }

    fn names(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_register_writes_registry_and_table() {
        let (dir, table, manager) = setup(&["MAILTO=root"]);

        let outcome = manager
            .register(Job::new("a", "0 3 * * * run a"))
            .await
            .unwrap();
        assert_eq!(outcome, Registration::Created);

        assert_eq!(
            table.lines().await,
            names(&["MAILTO=root", "0 3 * * * run a #backupctl:a"])
        );
        let raw = std::fs::read_to_string(dir.path().join("REGISTERED_JOBS")).unwrap();
        assert_eq!(raw, "a 0 3 * * * run a ENABLED\n");
        // released once the call returns
        TableLock::acquire(dir.path().join(".table.lock"), Duration::ZERO)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_register_after_holder_was_killed() {
        let (dir, table, manager) = setup(&[]);
        std::fs::write(dir.path().join(".table.lock"), "999999\n").unwrap();

        manager.register(Job::new("a", "0 3 * * * run a")).await.unwrap();
        assert_eq!(table.lines().await, names(&["0 3 * * * run a #backupctl:a"]));
    }

    #[tokio::test]
    async fn test_reregister_keeps_line_position() {
        let (_dir, table, manager) = setup(&["first"]);
        manager.register(Job::new("a", "0 3 * * * run a")).await.unwrap();
        manager.register(Job::new("b", "0 4 * * * run b")).await.unwrap();

        let outcome = manager
            .register(Job::new("a", "30 1 * * * run a"))
            .await
            .unwrap();
        assert_eq!(outcome, Registration::Replaced);
        assert_eq!(
            table.lines().await,
            names(&[
                "first",
                "30 1 * * * run a #backupctl:a",
                "0 4 * * * run b #backupctl:b",
            ])
        );
    }

    #[tokio::test]
    async fn test_register_rejects_bad_name() {
        let (_dir, table, manager) = setup(&[]);
        let err = manager
            .register(Job::new("bad name", "0 3 * * * x"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidJob(_)));
        assert_eq!(table.write_count().await, 0);
    }

    #[tokio::test]
    async fn test_disable_then_enable() {
        let (_dir, table, manager) = setup(&[]);
        manager.register(Job::new("a", "0 3 * * * run a")).await.unwrap();

        let report = manager
            .set_status(&names(&["a"]), JobStatus::Disabled)
            .await
            .unwrap();
        assert_eq!(report.succeeded, names(&["a"]));
        assert_eq!(table.lines().await, names(&["# 0 3 * * * run a #backupctl:a"]));

        manager.set_status(&[], JobStatus::Enabled).await.unwrap();
        assert_eq!(table.lines().await, names(&["0 3 * * * run a #backupctl:a"]));
    }

    #[tokio::test]
    async fn test_batch_continues_past_unknown_target() {
        let (_dir, table, manager) = setup(&[]);
        manager.register(Job::new("a", "0 3 * * * run a")).await.unwrap();
        manager.register(Job::new("b", "0 4 * * * run b")).await.unwrap();

        let report = manager
            .set_status(&names(&["ghost", "b"]), JobStatus::Disabled)
            .await
            .unwrap();

        assert!(!report.is_success());
        assert_eq!(report.succeeded, names(&["b"]));
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "ghost");
        assert!(matches!(report.failed[0].1, SchedulerError::NotFound(_)));
        assert_eq!(
            table.lines().await,
            names(&[
                "0 3 * * * run a #backupctl:a",
                "# 0 4 * * * run b #backupctl:b",
            ])
        );
    }

    #[tokio::test]
    async fn test_remove_drops_line_and_keeps_foreign() {
        let (_dir, table, manager) = setup(&["foreign one"]);
        manager.register(Job::new("a", "0 3 * * * run a")).await.unwrap();
        manager.register(Job::new("b", "0 4 * * * run b")).await.unwrap();

        let report = manager.remove(&names(&["a"])).await.unwrap();
        assert_eq!(report.succeeded, names(&["a"]));
        assert_eq!(
            table.lines().await,
            names(&["foreign one", "0 4 * * * run b #backupctl:b"])
        );
        assert!(!manager.registry().await.unwrap().contains_key("a"));
    }

    #[tokio::test]
    async fn test_remove_all_on_empty_registry_is_noop() {
        let (_dir, table, manager) = setup(&["foreign"]);
        let report = manager.remove(&[]).await.unwrap();
        assert!(report.is_empty());
        assert_eq!(table.write_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_table_write_surfaces_and_repair_recovers() {
        let (_dir, table, manager) = setup(&["foreign"]);
        table.fail_writes(Some("crontab: installing new crontab failed".to_string())).await;

        let err = manager
            .register(Job::new("a", "0 3 * * * run a"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::ExternalTool { .. }));
        // The registry was written first, so the two now disagree
        assert_eq!(table.lines().await, names(&["foreign"]));
        let (_, report) = manager.status().await.unwrap();
        assert!(!report.is_consistent());

        table.fail_writes(None).await;
        let report = manager.repair().await.unwrap();
        assert!(report.is_consistent());
        assert_eq!(
            table.lines().await,
            names(&["foreign", "0 3 * * * run a #backupctl:a"])
        );
    }
}
