//! Job registry and crontab reconciliation for backupctl.
//!
//! This crate keeps two pieces of state in agreement:
//! - The registry file, the source of truth for every job
//! - The host's crontab, where each job owns exactly one tagged line
//!
//! Administrative commands go through [`JobManager`], which rewrites the
//! registry and then reconciles the table under an advisory lock.

mod audit;
mod crontab;
mod error;
mod lock;
mod manager;
mod reconcile;
mod registry;
mod types;

pub use audit::{AuditReport, Finding, check, repair};
pub use crontab::{CrontabTable, MemoryTable, SchedulerTable};
pub use error::SchedulerError;
pub use lock::TableLock;
pub use manager::{BatchReport, JobManager, Registration};
pub use reconcile::{Reconciliation, apply, reconcile};
pub use registry::{RegistryStore, parse_registry, render_registry};
pub use types::{
    DISABLED_PREFIX, Job, JobStatus, Registry, TAG_PREFIX, managed_name, tag_for, validate_name,
};
