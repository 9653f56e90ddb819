//! Make the scheduler table agree with the registry.

use tracing::{debug, info};

use crate::{Registry, SchedulerError, SchedulerTable, managed_name};

/// Result of reconciling a table against a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// The table as it should be.
    pub lines: Vec<String>,
    /// Whether `lines` differs from the input table.
    pub changed: bool,
    /// Extra managed lines dropped because a job already had one.
    pub duplicates_removed: usize,
    /// Managed lines dropped because their job is no longer registered.
    pub orphans_removed: usize,
}

/// Compute the reconciled table without touching anything.
///
/// For each job, in name order: every line tagged for it is removed and the
/// canonical line goes back where the first one was, or at the end if there
/// was none. Managed lines of unregistered jobs are dropped. Foreign lines
/// keep their content and relative order.
pub fn reconcile(current: &[String], registry: &Registry) -> Reconciliation {
    let mut lines: Vec<String> = Vec::with_capacity(current.len() + registry.len());
    let mut orphans_removed = 0;

    for line in current {
        match managed_name(line) {
            Some(name) if !registry.contains_key(name) => orphans_removed += 1,
            _ => lines.push(line.clone()),
        }
    }

    let mut duplicates_removed = 0;
    for job in registry.values() {
        let mut first = None;
        let mut matches = 0;
        let mut idx = 0;

        while idx < lines.len() {
            if managed_name(&lines[idx]) == Some(job.name.as_str()) {
                first.get_or_insert(idx);
                matches += 1;
                lines.remove(idx);
            } else {
                idx += 1;
            }
        }

        if matches > 1 {
            duplicates_removed += matches - 1;
        }

        let position = first.unwrap_or(lines.len());
        lines.insert(position, job.render_line());
    }

    let changed = lines != current;
    Reconciliation {
        lines,
        changed,
        duplicates_removed,
        orphans_removed,
    }
}

/// Read the table, reconcile it with `registry`, and write it back.
///
/// The table is replaced in a single write, so a failure leaves the previous
/// table in place. Nothing is written when the table already agrees.
#[tracing::instrument(skip_all, fields(jobs = registry.len()))]
pub async fn apply(
    table: &dyn SchedulerTable,
    registry: &Registry,
) -> Result<Reconciliation, SchedulerError> {
    let current = table.read().await?;
    let outcome = reconcile(&current, registry);

    if !outcome.changed {
        debug!("crontab already consistent");
        return Ok(outcome);
    }

    table.write(&outcome.lines).await?;
    info!(
        lines = outcome.lines.len(),
        duplicates_removed = outcome.duplicates_removed,
        orphans_removed = outcome.orphans_removed,
        "reconciled crontab"
    );

    Ok(outcome)
}
