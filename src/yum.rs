//! Package-manager level checks that sit above the database itself.
//!
//! A wedged yum process can hold the database hostage indefinitely; a stale
//! pidfile from a crashed yum blocks every later transaction. Both are
//! cleared here before any database-level diagnosis starts.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use nix::sys::signal::Signal;

use crate::exec::{self, RunOptions};
use crate::pidutil;
use crate::report::{ActionLog, Diagnosis, RepairAction};

const YUM_TIMEOUT: Duration = Duration::from_secs(30);
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// A pidfile younger than this is presumed to belong to a legitimately
/// running transaction and is left alone.
const DEFAULT_MIN_PIDFILE_AGE: Duration = Duration::from_secs(6 * 3600);

pub struct Yum {
    yum_path: String,
    pidfile: PathBuf,
    min_pidfile_age: Duration,
    actions: ActionLog,
}

impl Yum {
    pub fn new(yum_path: String, actions: ActionLog) -> Self {
        Self {
            yum_path,
            pidfile: PathBuf::from("/var/run/yum.pid"),
            min_pidfile_age: DEFAULT_MIN_PIDFILE_AGE,
            actions,
        }
    }

    #[cfg(test)]
    fn with_pidfile(mut self, pidfile: PathBuf, min_age: Duration) -> Self {
        self.pidfile = pidfile;
        self.min_pidfile_age = min_age;
        self
    }

    /// PID and age of the current pidfile, if it parses.
    fn pidfile_info(&self) -> Option<(u32, Duration)> {
        let contents = std::fs::read_to_string(&self.pidfile).ok()?;
        let pid = contents.trim().parse::<u32>().ok()?;
        let mtime = std::fs::metadata(&self.pidfile).ok()?.modified().ok()?;
        let age = SystemTime::now()
            .duration_since(mtime)
            .unwrap_or(Duration::ZERO);
        Some((pid, age))
    }

    /// Kills a yum process whose pidfile has gone stale. Returns false only
    /// when something looked genuinely wrong (an unparseable pidfile, or a
    /// pidfile pointing at a process that is not yum); a missing pidfile or
    /// a fresh one means nothing is stuck.
    pub async fn check_stuck(&self, dry_run: bool) -> bool {
        let Some((pid, age)) = self.pidfile_info() else {
            if self.pidfile.exists() {
                tracing::error!(
                    "Found pidfile at {} but could not parse it",
                    self.pidfile.display()
                );
                return false;
            }
            tracing::info!("No yum pidfile found");
            return true;
        };

        if age < self.min_pidfile_age {
            tracing::info!(
                "yum pidfile is only {}s old, leaving pid {} alone",
                age.as_secs(),
                pid
            );
            return true;
        }

        match pidutil::comm_of(pid) {
            Some(comm) if comm == "yum" => {}
            Some(comm) => {
                tracing::error!(
                    "Stale pidfile pid {} is running '{}', not yum; refusing to kill",
                    pid,
                    comm
                );
                return false;
            }
            None => {
                tracing::error!("Failed to get command name for pid {}", pid);
                return false;
            }
        }

        tracing::info!("Found stuck yum process {}, age {}s", pid, age.as_secs());
        if dry_run {
            tracing::info!("Dry-run mode; would have killed pid {}", pid);
            return true;
        }

        tracing::info!("Killing pid {}", pid);
        if !pidutil::send_signal(pid, Signal::SIGKILL, KILL_TIMEOUT).await {
            return false;
        }
        self.actions.record(RepairAction::StuckYum);
        true
    }

    /// `yum check`: asks yum itself to look for problems in the rpmdb.
    pub async fn run_yum_check(&self) -> Diagnosis {
        self.run(&["check"]).await
    }

    /// `yum clean expire-cache`: a cheap smoke test that yum itself can
    /// operate against the database.
    pub async fn run_yum_clean(&self) -> Diagnosis {
        self.run(&["clean", "expire-cache"]).await
    }

    async fn run(&self, args: &[&str]) -> Diagnosis {
        let mut argv = vec![self.yum_path.clone()];
        argv.extend(args.iter().map(|s| s.to_string()));
        match exec::run_with_timeout(&argv, YUM_TIMEOUT, RunOptions::default()).await {
            Ok(_) => Diagnosis::Healthy,
            Err(e) => {
                tracing::error!("yum {} failed: {}", args.join(" "), e);
                Diagnosis::NeedsRebuild
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn yum_in(dir: &std::path::Path, script: &str) -> Yum {
        let tool = dir.join("yum");
        std::fs::write(&tool, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        Yum::new(tool.display().to_string(), ActionLog::new())
            .with_pidfile(dir.join("yum.pid"), Duration::ZERO)
    }

    #[tokio::test]
    async fn missing_pidfile_means_nothing_stuck() {
        let dir = tempfile::tempdir().unwrap();
        let yum = yum_in(dir.path(), "true");
        assert!(yum.check_stuck(false).await);
        assert!(yum.actions.is_empty());
    }

    #[tokio::test]
    async fn unparseable_pidfile_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let yum = yum_in(dir.path(), "true");
        std::fs::write(dir.path().join("yum.pid"), "not a pid").unwrap();
        assert!(!yum.check_stuck(false).await);
    }

    #[tokio::test]
    async fn fresh_pidfile_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut yum = yum_in(dir.path(), "true");
        yum.min_pidfile_age = Duration::from_secs(6 * 3600);
        std::fs::write(dir.path().join("yum.pid"), "12345").unwrap();
        assert!(yum.check_stuck(false).await);
        assert!(yum.actions.is_empty());
    }

    #[tokio::test]
    async fn stale_pidfile_for_vanished_process_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let yum = yum_in(dir.path(), "true");
        // PID from far outside any plausible live range.
        std::fs::write(dir.path().join("yum.pid"), "4194000").unwrap();
        assert!(!yum.check_stuck(false).await);
        assert!(yum.actions.is_empty());
    }

    #[tokio::test]
    async fn refuses_to_kill_a_process_that_is_not_yum() {
        let dir = tempfile::tempdir().unwrap();
        let yum = yum_in(dir.path(), "true");
        // Our own test process: definitely alive, definitely not yum.
        std::fs::write(dir.path().join("yum.pid"), std::process::id().to_string()).unwrap();
        assert!(!yum.check_stuck(false).await);
        assert!(yum.actions.is_empty());
    }

    #[tokio::test]
    async fn yum_check_maps_failure_to_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let yum = yum_in(dir.path(), "exit 1");
        assert_eq!(yum.run_yum_check().await, Diagnosis::NeedsRebuild);
        assert_eq!(yum.run_yum_clean().await, Diagnosis::NeedsRebuild);
    }

    #[tokio::test]
    async fn yum_check_passes_when_yum_works() {
        let dir = tempfile::tempdir().unwrap();
        let yum = yum_in(dir.path(), "exit 0");
        assert_eq!(yum.run_yum_check().await, Diagnosis::Healthy);
    }
}
