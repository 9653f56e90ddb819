//! Read-only consistency check between the registry and the table.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{info, warn};

use crate::{Registry, SchedulerError, SchedulerTable, apply, managed_name};

/// One inconsistency between the registry and the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    /// A registered job has no line in the table.
    Missing { job: String },
    /// A registered job has more than one line.
    Duplicate { job: String, count: usize },
    /// The job's only line differs from its canonical rendering.
    Mismatch {
        job: String,
        expected: String,
        found: String,
    },
    /// A managed line whose job is not registered.
    Orphan { job: String, line: String },
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Finding::Missing { job } => write!(f, "{}: no crontab entry", job),
            Finding::Duplicate { job, count } => {
                write!(f, "{}: {} crontab entries, expected 1", job, count)
            }
            Finding::Mismatch {
                job,
                expected,
                found,
            } => write!(
                f,
                "{}: crontab entry differs\n    expected: {}\n    found:    {}",
                job, expected, found
            ),
            Finding::Orphan { job, line } => {
                write!(f, "{}: not in the registry but present in crontab: {}", job, line)
            }
        }
    }
}

/// Verdict of a consistency check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    /// Registered jobs examined.
    pub jobs: usize,
    /// Managed lines seen in the table.
    pub managed_lines: usize,
    /// Every problem found, in job-name order.
    pub findings: Vec<Finding>,
}

impl AuditReport {
    pub fn is_consistent(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Compare a registry with table lines.
pub fn check(registry: &Registry, lines: &[String]) -> AuditReport {
    let mut by_job: BTreeMap<&str, Vec<&String>> = BTreeMap::new();
    for line in lines {
        if let Some(name) = managed_name(line) {
            by_job.entry(name).or_default().push(line);
        }
    }

    let managed_lines = by_job.values().map(Vec::len).sum();
    let mut findings = Vec::new();

    for job in registry.values() {
        match by_job.get(job.name.as_str()).map(Vec::as_slice) {
            None | Some([]) => findings.push(Finding::Missing {
                job: job.name.clone(),
            }),
            Some([line]) => {
                let expected = job.render_line();
                if **line != expected {
                    findings.push(Finding::Mismatch {
                        job: job.name.clone(),
                        expected,
                        found: (*line).clone(),
                    });
                }
            }
            Some(many) => findings.push(Finding::Duplicate {
                job: job.name.clone(),
                count: many.len(),
            }),
        }
    }

    for (name, found) in &by_job {
        if !registry.contains_key(*name) {
            for line in found {
                findings.push(Finding::Orphan {
                    job: name.to_string(),
                    line: (*line).clone(),
                });
            }
        }
    }

    AuditReport {
        jobs: registry.len(),
        managed_lines,
        findings,
    }
}

/// Reconcile the table and check it again.
pub async fn repair(
    table: &dyn SchedulerTable,
    registry: &Registry,
) -> Result<AuditReport, SchedulerError> {
    apply(table, registry).await?;
    let report = check(registry, &table.read().await?);

    if report.is_consistent() {
        info!(jobs = report.jobs, "crontab repaired");
    } else {
        warn!(
            findings = report.findings.len(),
            "crontab still inconsistent after repair"
        );
    }

    Ok(report)
}
