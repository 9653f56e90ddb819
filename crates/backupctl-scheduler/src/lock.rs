//! Advisory lock around registry + crontab read-modify-write.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use tokio::time::sleep;
use tracing::debug;

use crate::SchedulerError;

/// Delay between attempts to take a held lock.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// An exclusive `flock` on the lock file, held while this value lives.
///
/// The kernel drops the lock when the file is closed, including when the
/// process dies, so a killed holder never leaves the lock behind. The file
/// itself stays in place and records the last holder's pid.
#[derive(Debug)]
pub struct TableLock {
    path: PathBuf,
    _file: File,
}

impl TableLock {
    /// Take the lock, waiting up to `timeout` for a current holder.
    pub async fn acquire(path: impl Into<PathBuf>, timeout: Duration) -> Result<Self, SchedulerError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?
            .into_std()
            .await;

        let started = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if started.elapsed() >= timeout {
                        let holder = tokio::fs::read_to_string(&path)
                            .await
                            .map(|s| s.trim().to_string())
                            .unwrap_or_default();
                        return Err(SchedulerError::Lock(format!(
                            "{} is held by pid {}",
                            path.display(),
                            if holder.is_empty() { "?" } else { holder.as_str() }
                        )));
                    }
                    sleep(POLL_INTERVAL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        // On error the file is closed here, which releases the lock
        record_pid(&file)?;
        debug!(path = %path.display(), "acquired table lock");
        Ok(Self { path, _file: file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn record_pid(mut file: &File) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", std::process::id())?;
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_lock_records_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".table.lock");

        let lock = TableLock::acquire(&path, Duration::from_millis(50)).await.unwrap();
        let pid = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(pid, format!("{}\n", std::process::id()));
    }

    #[tokio::test]
    async fn test_second_acquire_times_out_naming_holder() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".table.lock");

        let _held = TableLock::acquire(&path, Duration::from_millis(50)).await.unwrap();
        let err = TableLock::acquire(&path, Duration::from_millis(150))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Lock(_)));
        assert!(err.to_string().contains(&std::process::id().to_string()));
    }

    #[tokio::test]
    async fn test_released_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".table.lock");

        let lock = TableLock::acquire(&path, Duration::from_millis(50)).await.unwrap();
        drop(lock);

        TableLock::acquire(&path, Duration::ZERO).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_left_by_dead_holder_does_not_block() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".table.lock");
        std::fs::write(&path, "999999\n").unwrap();

        let lock = TableLock::acquire(&path, Duration::ZERO).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(lock.path()).unwrap(),
            format!("{}\n", std::process::id())
        );
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".table.lock");

        let held = TableLock::acquire(&path, Duration::from_millis(50)).await.unwrap();
        let waiter = tokio::spawn({
            let path = path.clone();
            async move { TableLock::acquire(path, Duration::from_secs(5)).await }
        });

        sleep(Duration::from_millis(250)).await;
        drop(held);

        let lock = waiter.await.unwrap().unwrap();
        assert!(lock.path().exists());
    }
}
