//! Database operations adapter.
//!
//! Wraps every diagnostic and repair command run against the RPM database
//! and classifies raw command results into typed [`Diagnosis`] values. The
//! database itself is opaque: it is only ever manipulated through the
//! external rpm/Berkeley-DB tooling, one bounded command at a time.

pub mod indexes;

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;

use crate::config::Config;
use crate::error::Result;
use crate::exec::{self, status_code, RunOptions};
use crate::forensic::ForensicSink;
use crate::pidutil;
use crate::report::{ActionLog, Diagnosis, RecoveryOutcome, RepairAction};

const RPM_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);
const YUM_COMPLETE_TIMEOUT: Duration = Duration::from_secs(10);
const RECOVER_TIMEOUT: Duration = Duration::from_secs(90);
const REBUILD_TIMEOUT: Duration = Duration::from_secs(300);

/// Below this count, `rpm -qa` output on an authoritative host means the
/// Packages table is lying, not that the host is freshly provisioned.
const MIN_ACCEPTABLE_PKG_COUNT: usize = 50;

/// Stale `rpm -q` processes older than this get reaped.
const QUERY_KILL_AFTER: Duration = Duration::from_secs(3600);
const QUERY_KILL_TIMEOUT: Duration = Duration::from_secs(5);

static RPM_BINARY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(/(usr/)?bin/)?rpm$").expect("static regex"));

/// Seam between the controller and the real database tooling; tests
/// substitute scripted adapters.
#[async_trait]
pub trait DbAdapter: Send {
    /// Capture `db_stat -CA` output to the forensic sink. Best effort.
    async fn db_stat(&self);

    /// Reap `rpm -q` processes that have been running for over an hour.
    async fn kill_spinning_rpm_query_processes(&self);

    /// Probe each index that has a canary query; delete-and-regenerate an
    /// index whose canary fails its predicates, escalating to
    /// `NeedsRecovery` when regeneration does not engage.
    async fn check_indexes(&self) -> Diagnosis;

    /// Black-box existence check: does `rpm -qa` work at all, and does it
    /// return a plausible number of entries?
    async fn check_rpm_qa(&self) -> Diagnosis;

    /// Spot check a single well-known package by name.
    async fn query(&self, package: &str) -> Diagnosis;

    /// Re-query every installed package individually and look for
    /// "is not installed" mismatches against the full listing.
    async fn check_tables(&self) -> Diagnosis;

    /// Run db_verify over every non-blacklisted table.
    async fn verify_tables(&self) -> Diagnosis;

    /// Run db_recover. A crash means only a rebuild can proceed; any other
    /// nonzero exit is an error.
    async fn recover_db(&self) -> Result<RecoveryOutcome>;

    /// Run `rpm --rebuilddb`.
    async fn rebuild_db(&self) -> Result<()>;

    /// Re-enumerate the on-disk table list. Must be called after any
    /// structural repair; the list is never refreshed implicitly.
    fn refresh_tables(&mut self) -> Result<()>;

    /// Run yum-complete-transaction --cleanup. Best effort.
    async fn clean_yum_transactions(&self);
}

/// The real adapter, holding the database handle state for the run.
pub struct RpmDb {
    dbpath: PathBuf,
    rpm_path: String,
    recover_path: String,
    verify_path: String,
    stat_path: String,
    yum_complete_transaction_path: String,
    blacklist: Vec<String>,
    tables: Vec<String>,
    /// Whether this package system is the platform's source of truth. On
    /// non-authoritative platforms a near-empty database is legitimate and
    /// the minimum-count floor must not fire.
    authoritative: bool,
    forensic_sink: Option<ForensicSink>,
    actions: ActionLog,
    os_release: OnceCell<HashMap<String, String>>,
}

impl RpmDb {
    pub fn new(config: &Config, actions: ActionLog) -> Result<Self> {
        let mut db = Self {
            dbpath: config.dbpath.clone(),
            rpm_path: config.rpm_path.clone(),
            recover_path: config.recover_path.clone(),
            verify_path: config.verify_path.clone(),
            stat_path: config.stat_path.clone(),
            yum_complete_transaction_path: config.yum_complete_transaction_path.clone(),
            blacklist: config.blacklist.clone(),
            tables: Vec::new(),
            authoritative: std::env::consts::OS == "linux",
            forensic_sink: config
                .forensic
                .then(|| ForensicSink::new(config.forensic_dir.clone())),
            actions,
            os_release: OnceCell::new(),
        };
        db.refresh_tables()?;
        Ok(db)
    }

    /// Overrides platform authoritativeness; used by tests to exercise both
    /// branches of the minimum-count floor.
    pub fn with_authoritative(mut self, authoritative: bool) -> Self {
        self.authoritative = authoritative;
        self
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    fn dbpath_str(&self) -> String {
        self.dbpath.display().to_string()
    }

    fn rpm_argv(&self, args: &[&str]) -> Vec<String> {
        let mut argv = vec![
            self.rpm_path.clone(),
            "--dbpath".to_string(),
            self.dbpath_str(),
        ];
        argv.extend(args.iter().map(|s| s.to_string()));
        argv
    }

    fn os_release(&self) -> &HashMap<String, String> {
        self.os_release.get_or_init(|| {
            let mut data = HashMap::new();
            if let Ok(contents) = std::fs::read_to_string("/etc/os-release") {
                for line in contents.lines() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Some((key, value)) = line.split_once('=') {
                        data.insert(
                            key.trim().to_string(),
                            value.trim().trim_matches('"').to_string(),
                        );
                    }
                }
            }
            data
        })
    }

    /// Probes one canary and, on predicate failure, deletes the index and
    /// re-runs the query to trigger lazy regeneration. Returns
    /// `NeedsRecovery` when the regeneration path does not engage.
    async fn poke_index(&self, canary: &indexes::Canary) -> Diagnosis {
        let argv = canary.argv(&self.rpm_path, &self.dbpath_str());
        tracing::info!("Attempting to selectively poke at {} index", canary.index);

        let proc = match exec::run_with_timeout(
            &argv,
            RPM_CHECK_TIMEOUT,
            RunOptions::tolerate_nonzero(),
        )
        .await
        {
            Ok(proc) => proc,
            Err(e) => {
                tracing::info!("RPM commands are failing too hard: {}", e);
                return Diagnosis::NeedsRecovery;
            }
        };

        let failed = canary
            .checks
            .iter()
            .find(|check| !(check.check)(&proc));
        let Some(failed) = failed else {
            return Diagnosis::Healthy;
        };
        tracing::info!(
            index = canary.index,
            check = failed.name,
            "canary predicate failed"
        );

        // Single-index repair: drop the index file and let rpm re-derive it
        // lazily on the next query.
        self.actions.record(RepairAction::IndexRebuild);
        let index_path = self.dbpath.join(canary.index);
        if index_path.is_file() {
            tracing::info!("{} index is out of whack, deleting it", canary.index);
            if let Err(e) = std::fs::remove_file(&index_path) {
                tracing::warn!("Could not delete {}: {}", index_path.display(), e);
                return Diagnosis::NeedsRecovery;
            }
        } else {
            tracing::info!("{} index is missing", canary.index);
        }

        let proc = match exec::run_with_timeout(
            &argv,
            RPM_CHECK_TIMEOUT,
            RunOptions::tolerate_nonzero(),
        )
        .await
        {
            Ok(proc) => proc,
            Err(e) => {
                tracing::info!("RPM commands are failing too hard: {}", e);
                return Diagnosis::NeedsRecovery;
            }
        };

        // Post-conditions: rpm must still be able to open Packages, and must
        // have noticed the missing index (proof the regeneration path
        // engaged). Otherwise single-index repair is insufficient.
        let packages_broken = proc
            .stderr_lines()
            .any(|l| l.contains("cannot open Packages database"));
        let regeneration_engaged = proc.stderr_lines().any(|l| l.contains("missing index"));
        if packages_broken || !regeneration_engaged {
            tracing::info!("Granular index rebuild failed");
            return Diagnosis::NeedsRecovery;
        }
        Diagnosis::Healthy
    }
}

#[async_trait]
impl DbAdapter for RpmDb {
    async fn db_stat(&self) {
        let Some(sink) = &self.forensic_sink else {
            return;
        };
        let argv = vec![
            self.stat_path.clone(),
            "-CA".to_string(),
            "-h".to_string(),
            self.dbpath_str(),
        ];
        match exec::run_with_timeout(&argv, RPM_CHECK_TIMEOUT, RunOptions::best_effort()).await {
            Ok(proc) => {
                // db_stat itself can fail on a wedged environment; the
                // failure output is exactly what we want preserved.
                let contents = if proc.exit_code != status_code::SUCCESS {
                    &proc.stderr
                } else {
                    &proc.stdout
                };
                sink.capture("db_stat", contents);
            }
            Err(e) => tracing::error!("db_stat -CA failed: {}", e),
        }
    }

    async fn kill_spinning_rpm_query_processes(&self) {
        for pid in pidutil::live_pids() {
            let Some(cmd) = pidutil::cmdline_of(pid) else {
                continue;
            };
            if cmd.len() < 2 {
                continue;
            }
            if !(RPM_BINARY_RE.is_match(&cmd[0]) && cmd.iter().any(|a| a == "-q")) {
                continue;
            }

            tracing::info!("Considering pid {}", pid);
            let Some(age) = pidutil::process_age(pid) else {
                tracing::warn!("Skipping pid {}, it disappeared", pid);
                continue;
            };
            if age > QUERY_KILL_AFTER {
                tracing::error!(
                    "Found stale rpm process: ({}) {}",
                    pid,
                    cmd.join(" ")
                );
                pidutil::send_signal(pid, Signal::SIGKILL, QUERY_KILL_TIMEOUT).await;
            }
        }
    }

    async fn check_indexes(&self) -> Diagnosis {
        if cfg!(target_os = "macos") {
            tracing::debug!("index probing is not implemented for darwin");
            return Diagnosis::Healthy;
        }

        let os_id = self.os_release().get("ID").cloned().unwrap_or_default();
        for canary in indexes::canaries_for(&os_id) {
            match self.poke_index(canary).await {
                Diagnosis::Healthy => {}
                other => return other,
            }
        }
        Diagnosis::Healthy
    }

    async fn check_rpm_qa(&self) -> Diagnosis {
        let argv = self.rpm_argv(&["-qa"]);
        let result =
            match exec::run_with_timeout(&argv, RPM_CHECK_TIMEOUT, RunOptions::default()).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("rpm -qa failed: {}", e);
                    return Diagnosis::NeedsRecovery;
                }
            };

        let count = result.stdout.split_whitespace().count();
        if self.authoritative && count < MIN_ACCEPTABLE_PKG_COUNT {
            tracing::error!(
                "rpm package count seems too low; saw {}, expected at least {}",
                count,
                MIN_ACCEPTABLE_PKG_COUNT
            );
            return Diagnosis::NeedsRecovery;
        }
        tracing::debug!("Package count: {}", count);
        Diagnosis::Healthy
    }

    async fn query(&self, package: &str) -> Diagnosis {
        let argv = self.rpm_argv(&["-q", package]);
        let result =
            match exec::run_with_timeout(&argv, RPM_CHECK_TIMEOUT, RunOptions::default()).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("rpm -q {} failed: {}", package, e);
                    return Diagnosis::NeedsRecovery;
                }
            };

        let tokens: Vec<&str> = result.stdout.split_whitespace().collect();
        let prefix = format!("{package}-");
        if tokens.len() != 1 || !tokens[0].starts_with(&prefix) {
            return Diagnosis::NeedsRebuild;
        }
        Diagnosis::Healthy
    }

    async fn check_tables(&self) -> Diagnosis {
        let argv = self.rpm_argv(&["-qa", "--qf", "%{NAME}\\n"]);
        let listing =
            match exec::run_with_timeout(&argv, RPM_CHECK_TIMEOUT, RunOptions::default()).await {
                Ok(listing) => listing,
                Err(e) => {
                    tracing::warn!("initial table listing failed: {}", e);
                    return Diagnosis::NeedsRebuild;
                }
            };

        let names: BTreeSet<&str> = listing
            .stdout_lines()
            .filter(|l| !l.is_empty())
            .collect();
        // Assume healthy if no RPMs listed.
        if names.is_empty() {
            return Diagnosis::Healthy;
        }

        let mut argv = self.rpm_argv(&["-q"]);
        argv.extend(names.iter().map(|n| n.to_string()));
        let result =
            match exec::run_with_timeout(&argv, RPM_CHECK_TIMEOUT, RunOptions::default()).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!("per-package re-query failed: {}", e);
                    return Diagnosis::NeedsRebuild;
                }
            };

        if result
            .stdout_lines()
            .any(|l| l.ends_with("is not installed"))
        {
            return Diagnosis::NeedsRebuild;
        }
        Diagnosis::Healthy
    }

    async fn verify_tables(&self) -> Diagnosis {
        for table in &self.tables {
            if self.blacklist.iter().any(|b| b == table) {
                tracing::warn!("Skipping table '{}', blacklisted", table);
                continue;
            }

            let argv = vec![
                self.verify_path.clone(),
                self.dbpath.join(table).display().to_string(),
            ];
            let result = match exec::run_with_timeout(
                &argv,
                VERIFY_TIMEOUT,
                RunOptions::tolerate_nonzero(),
            )
            .await
            {
                Ok(result) => result,
                Err(e) => {
                    return Diagnosis::Failure(format!("db_verify of {table} failed to run: {e}"));
                }
            };

            if result.exit_code != 0 {
                tracing::error!("db_verify returned nonzero status for {}", table);
                return Diagnosis::Failure(format!(
                    "db_verify returned {} for {table}",
                    result.exit_code
                ));
            }
        }
        Diagnosis::Healthy
    }

    async fn recover_db(&self) -> Result<RecoveryOutcome> {
        let argv = vec![
            self.recover_path.clone(),
            "-h".to_string(),
            self.dbpath_str(),
        ];
        let proc =
            exec::run_with_timeout(&argv, RECOVER_TIMEOUT, RunOptions::tolerate_nonzero()).await?;

        if proc.exit_code != status_code::SUCCESS {
            tracing::warn!("db_recover failed with exit code {}", proc.exit_code);
            // An unrecoverable failure mode we have seen in the wild:
            // db_recover itself segfaults, remediable only by a rebuild.
            if proc.exit_code == status_code::SEGFAULT {
                return Ok(RecoveryOutcome::RebuildRequired);
            }
            return Err(crate::error::Error::RecoveryFailed {
                code: proc.exit_code,
                stderr: proc.stderr.trim().to_string(),
            });
        }

        if let Some(sink) = &self.forensic_sink {
            sink.capture("db_recover", &proc.stderr);
        }
        Ok(RecoveryOutcome::Recovered)
    }

    async fn rebuild_db(&self) -> Result<()> {
        let argv = self.rpm_argv(&["--rebuilddb"]);
        exec::run_with_timeout(&argv, REBUILD_TIMEOUT, RunOptions::default())
            .await
            .map_err(|e| {
                tracing::warn!("table rebuild failed");
                e
            })?;
        Ok(())
    }

    fn refresh_tables(&mut self) -> Result<()> {
        // Table files are the capitalized entries (Packages, Basenames,
        // ...); environment and lock files are lowercase or dunder-prefixed.
        let mut tables = Vec::new();
        for entry in std::fs::read_dir(&self.dbpath)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.chars().next().is_some_and(|c| c.is_ascii_uppercase()) {
                tables.push(name);
            }
        }
        tables.sort();
        self.tables = tables;
        Ok(())
    }

    async fn clean_yum_transactions(&self) {
        self.actions.record(RepairAction::CleanYumTransactions);
        let argv = vec![
            self.yum_complete_transaction_path.clone(),
            "--cleanup".to_string(),
        ];
        if let Err(e) =
            exec::run_with_timeout(&argv, YUM_COMPLETE_TIMEOUT, RunOptions::best_effort()).await
        {
            tracing::warn!("yum-complete-transaction failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use super::*;
    use crate::error::Error;

    fn write_tool(dir: &Path, name: &str, script: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    fn fake_dbpath(dir: &Path) -> PathBuf {
        let dbpath = dir.join("rpmdb");
        std::fs::create_dir(&dbpath).unwrap();
        for name in ["Packages", "Basenames", "Providename", "__db.001", ".dbenv.lock"] {
            std::fs::write(dbpath.join(name), b"").unwrap();
        }
        dbpath
    }

    fn db_with(config: Config) -> RpmDb {
        RpmDb::new(&config, ActionLog::new()).unwrap()
    }

    #[test]
    fn refresh_tables_selects_capitalized_entries() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            dbpath: fake_dbpath(dir.path()),
            ..Config::default()
        };
        let db = db_with(config);
        assert_eq!(db.tables(), &["Basenames", "Packages", "Providename"]);
    }

    #[test]
    fn new_fails_on_missing_dbpath() {
        let config = Config {
            dbpath: PathBuf::from("/nonexistent/rpmdb"),
            ..Config::default()
        };
        assert!(RpmDb::new(&config, ActionLog::new()).is_err());
    }

    #[tokio::test]
    async fn low_package_count_on_authoritative_host_needs_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            dbpath: fake_dbpath(dir.path()),
            rpm_path: write_tool(dir.path(), "rpm", "printf 'a-1\\nb-2\\nc-3\\n'"),
            ..Config::default()
        };
        let db = db_with(config).with_authoritative(true);
        assert_eq!(db.check_rpm_qa().await, Diagnosis::NeedsRecovery);
    }

    #[tokio::test]
    async fn low_package_count_elsewhere_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            dbpath: fake_dbpath(dir.path()),
            rpm_path: write_tool(dir.path(), "rpm", "printf 'a-1\\nb-2\\nc-3\\n'"),
            ..Config::default()
        };
        let db = db_with(config).with_authoritative(false);
        assert_eq!(db.check_rpm_qa().await, Diagnosis::Healthy);
    }

    #[tokio::test]
    async fn failing_rpm_qa_needs_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            dbpath: fake_dbpath(dir.path()),
            rpm_path: write_tool(dir.path(), "rpm", "exit 1"),
            ..Config::default()
        };
        let db = db_with(config).with_authoritative(true);
        assert_eq!(db.check_rpm_qa().await, Diagnosis::NeedsRecovery);
    }

    #[tokio::test]
    async fn spot_query_accepts_single_matching_package() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            dbpath: fake_dbpath(dir.path()),
            rpm_path: write_tool(dir.path(), "rpm", "echo coreutils-8.22-24.el7.x86_64"),
            ..Config::default()
        };
        let db = db_with(config);
        assert_eq!(db.query("coreutils").await, Diagnosis::Healthy);
    }

    #[tokio::test]
    async fn spot_query_rejects_garbage_output() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            dbpath: fake_dbpath(dir.path()),
            rpm_path: write_tool(dir.path(), "rpm", "echo something-else-1.0"),
            ..Config::default()
        };
        let db = db_with(config);
        assert_eq!(db.query("coreutils").await, Diagnosis::NeedsRebuild);
    }

    #[tokio::test]
    async fn check_tables_flags_not_installed_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        // First call lists names, second call reports one as missing.
        let script = r#"
state="$(dirname "$0")/state"
if [ ! -f "$state" ]; then
    touch "$state"
    printf 'coreutils\nrpm\n'
else
    printf 'coreutils-8.22\npackage rpm is not installed\n'
fi"#;
        let config = Config {
            dbpath: fake_dbpath(dir.path()),
            rpm_path: write_tool(dir.path(), "rpm", script),
            ..Config::default()
        };
        let db = db_with(config);
        assert_eq!(db.check_tables().await, Diagnosis::NeedsRebuild);
    }

    #[tokio::test]
    async fn check_tables_with_empty_listing_is_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            dbpath: fake_dbpath(dir.path()),
            rpm_path: write_tool(dir.path(), "rpm", "true"),
            ..Config::default()
        };
        let db = db_with(config);
        assert_eq!(db.check_tables().await, Diagnosis::Healthy);
    }

    #[tokio::test]
    async fn verify_skips_blacklisted_tables() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            dbpath: fake_dbpath(dir.path()),
            verify_path: write_tool(dir.path(), "db_verify", "exit 1"),
            blacklist: vec![
                "Basenames".to_string(),
                "Packages".to_string(),
                "Providename".to_string(),
            ],
            ..Config::default()
        };
        let db = db_with(config);
        assert_eq!(db.verify_tables().await, Diagnosis::Healthy);
    }

    #[tokio::test]
    async fn verify_failure_is_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            dbpath: fake_dbpath(dir.path()),
            verify_path: write_tool(dir.path(), "db_verify", "echo 'verification failed' >&2; exit 1"),
            blacklist: Vec::new(),
            ..Config::default()
        };
        let db = db_with(config);
        assert!(matches!(db.verify_tables().await, Diagnosis::Failure(_)));
    }

    #[tokio::test]
    async fn clean_recover_reports_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            dbpath: fake_dbpath(dir.path()),
            recover_path: write_tool(dir.path(), "db_recover", "exit 0"),
            ..Config::default()
        };
        let db = db_with(config);
        assert_eq!(db.recover_db().await.unwrap(), RecoveryOutcome::Recovered);
    }

    #[tokio::test]
    async fn crashed_recover_requires_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            dbpath: fake_dbpath(dir.path()),
            recover_path: write_tool(dir.path(), "db_recover", "kill -11 $$"),
            ..Config::default()
        };
        let db = db_with(config);
        assert_eq!(
            db.recover_db().await.unwrap(),
            RecoveryOutcome::RebuildRequired
        );
    }

    #[tokio::test]
    async fn plain_recover_failure_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            dbpath: fake_dbpath(dir.path()),
            recover_path: write_tool(
                dir.path(),
                "db_recover",
                "echo 'db_recover: DB_ENV->open: fatal region error' >&2; exit 1",
            ),
            ..Config::default()
        };
        let db = db_with(config);
        match db.recover_db().await {
            Err(Error::RecoveryFailed { code, stderr }) => {
                assert_eq!(code, 1);
                assert!(stderr.contains("fatal region error"));
            }
            other => panic!("expected RecoveryFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rebuild_propagates_command_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            dbpath: fake_dbpath(dir.path()),
            rpm_path: write_tool(dir.path(), "rpm", "exit 1"),
            ..Config::default()
        };
        let db = db_with(config);
        assert!(db.rebuild_db().await.is_err());
    }
}
