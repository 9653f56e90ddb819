//! Drives the built binary against a fake `crontab` program.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::{Mutex, MutexGuard};

use pretty_assertions::assert_eq;

/// Stores the table in a file next to itself, like `crontab -l` / `crontab -`.
const FAKE_CRONTAB: &str = r#"#!/bin/sh
store="$(dirname "$0")/table"
case "$1" in
  -l) [ -f "$store" ] || exit 1; cat "$store" ;;
  -) cat > "$store" ;;
  *) echo "unsupported: $*" >&2; exit 2 ;;
esac
"#;

// Writing an executable while another test forks can fail with ETXTBSY
static SERIAL: Mutex<()> = Mutex::new(());

struct Host {
    dir: tempfile::TempDir,
    crontab: PathBuf,
    _serial: MutexGuard<'static, ()>,
}

impl Host {
    fn new() -> Self {
        let serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let crontab = dir.path().join("crontab");
        fs::write(&crontab, FAKE_CRONTAB).unwrap();
        fs::set_permissions(&crontab, fs::Permissions::from_mode(0o755)).unwrap();
        Self {
            dir,
            crontab,
            _serial: serial,
        }
    }

    fn home(&self) -> PathBuf {
        self.dir.path().join("home")
    }

    fn table(&self) -> String {
        fs::read_to_string(self.dir.path().join("table")).unwrap_or_default()
    }

    fn backupctl(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_backupctl"))
            .args(args)
            .env("BACKUPCTL_HOME", self.home())
            .env("BACKUPCTL_CRONTAB", &self.crontab)
            .env("BACKUPCTL_RUN_COMMAND", "/usr/local/bin/backupctl")
            .env_remove("RUST_LOG")
            .output()
            .unwrap()
    }

    fn write_plan(&self, name: &str, script: &str) -> PathBuf {
        let path = self.dir.path().join(format!("{}.json", name));
        let plan = serde_json::json!({"name": name, "command": ["sh", "-c", script]});
        fs::write(&path, plan.to_string()).unwrap();
        path
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn path_arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn test_job_lifecycle() {
    let host = Host::new();
    fs::write(host.dir.path().join("table"), "MAILTO=ops@example.org\n").unwrap();

    let plan = host.write_plan("home", "echo synced");
    let out = host.backupctl(&["register", path_arg(&plan), "--schedule", "0 3 * * *"]);
    assert!(out.status.success(), "{:?}", out);
    assert_eq!(
        host.table(),
        "MAILTO=ops@example.org\n0 3 * * * /usr/local/bin/backupctl run home #backupctl:home\n"
    );

    let out = host.backupctl(&["status"]);
    assert!(out.status.success());
    assert!(stdout(&out).contains("Consistency check passed"));

    let out = host.backupctl(&["disable", "home", "ghost"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(host.table().contains("# 0 3 * * * /usr/local/bin/backupctl run home #backupctl:home"));

    let out = host.backupctl(&["run", "home", "--no-notify"]);
    assert!(out.status.success(), "{:?}", out);
    assert!(stdout(&out).starts_with("[Backup: home] OK ("));
    let logs: Vec<_> = fs::read_dir(host.home().join("log/home")).unwrap().collect();
    assert_eq!(logs.len(), 1);

    let out = host.backupctl(&["remove"]);
    assert!(out.status.success());
    assert_eq!(host.table(), "MAILTO=ops@example.org\n");
    assert!(!host.home().join("log/home").exists());
    assert!(!host.home().join("plans/home-plan.json").exists());
}

#[test]
fn test_run_unknown_job_exits_zero() {
    let host = Host::new();
    let out = host.backupctl(&["run", "ghost"]);
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("'ghost' is not a registered job"));
}

#[test]
fn test_invalid_schedule_is_rejected() {
    let host = Host::new();
    let plan = host.write_plan("home", "true");
    let out = host.backupctl(&["register", path_arg(&plan), "--schedule", "every night"]);
    assert!(!out.status.success());
    assert_eq!(host.table(), "");
}
