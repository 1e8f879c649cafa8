//! Run configuration: database path, tool paths, repair knobs.
//!
//! Tool paths are resolved once at startup (a PATH search, the same rules
//! `which` uses) and carried for the duration of the run; nothing resolves
//! lazily mid-repair.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default minimum free space required before attempting repairs: 150 MiB.
pub const DEFAULT_MIN_FREE_SPACE: u64 = 150 * 1048576;

/// Default retry budget for the diagnose-repair loop.
pub const DEFAULT_MAX_PASSES: u32 = 5;

/// Tables known to produce false positives under db_verify.
pub const DEFAULT_VERIFY_BLACKLIST: &[&str] = &["Filedigests", "Obsoletename", "Provideversion"];

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the RPM database directory.
    pub dbpath: PathBuf,
    /// Resolved tool paths.
    pub rpm_path: String,
    pub recover_path: String,
    pub verify_path: String,
    pub stat_path: String,
    pub yum_path: String,
    pub yum_complete_transaction_path: String,
    /// Tables skipped by per-table verification.
    pub blacklist: Vec<String>,
    /// Log intended repairs without performing them.
    pub dry_run: bool,
    /// Capture verbose tool output to the forensic sink.
    pub forensic: bool,
    pub forensic_dir: PathBuf,
    /// Retry budget for the pass loop.
    pub max_passes: u32,
    /// Minimum free bytes on the dbpath filesystem.
    pub min_free_space: u64,
    /// Optional pre-pass checks.
    pub check_stuck_yum: bool,
    pub clean_yum_transactions: bool,
    pub run_yum_check: bool,
    pub run_yum_clean: bool,
    /// Use lsof for lock-holder discovery instead of scanning /proc.
    pub use_lsof: bool,
    pub lsof_path: String,
    /// Directory scanned for stale yum transaction artifacts.
    pub yum_transactions_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dbpath: PathBuf::from("/var/lib/rpm"),
            rpm_path: "rpm".to_string(),
            recover_path: "db_recover".to_string(),
            verify_path: "db_verify".to_string(),
            stat_path: "db_stat".to_string(),
            yum_path: "yum".to_string(),
            yum_complete_transaction_path: "/usr/sbin/yum-complete-transaction".to_string(),
            blacklist: DEFAULT_VERIFY_BLACKLIST
                .iter()
                .map(|s| s.to_string())
                .collect(),
            dry_run: false,
            forensic: false,
            forensic_dir: PathBuf::from("/tmp"),
            max_passes: DEFAULT_MAX_PASSES,
            min_free_space: DEFAULT_MIN_FREE_SPACE,
            check_stuck_yum: false,
            clean_yum_transactions: false,
            run_yum_check: false,
            run_yum_clean: false,
            use_lsof: false,
            lsof_path: "lsof".to_string(),
            yum_transactions_dir: PathBuf::from("/var/lib/yum"),
        }
    }
}

impl Config {
    /// Whether the yum-level sanity checks apply: they only make sense on
    /// the system database, not a custom dbpath.
    pub fn is_default_dbpath(&self) -> bool {
        self.dbpath == Path::new("/var/lib/rpm")
    }
}

/// Finds `cmd` on PATH, requiring the execute bit. Absolute paths are
/// returned as-is when executable.
pub fn which(cmd: &str) -> Result<String> {
    use std::os::unix::fs::PermissionsExt;

    let is_executable = |p: &Path| {
        std::fs::metadata(p)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    };

    let candidate = Path::new(cmd);
    if candidate.is_absolute() {
        if is_executable(candidate) {
            return Ok(cmd.to_string());
        }
        return Err(Error::ToolNotFound(cmd.to_string()));
    }

    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        let full = dir.join(cmd);
        if is_executable(&full) {
            return Ok(full.display().to_string());
        }
    }
    Err(Error::ToolNotFound(cmd.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn which_finds_sh() {
        let path = which("sh").unwrap();
        assert!(path.ends_with("/sh"), "got {}", path);
    }

    #[test]
    fn which_accepts_absolute_executable() {
        assert_eq!(which("/bin/sh").unwrap(), "/bin/sh");
    }

    #[test]
    fn which_rejects_missing_tool() {
        assert!(which("surely-not-a-real-tool-name").is_err());
    }

    #[test]
    fn default_dbpath_gates_yum_checks() {
        let mut config = Config::default();
        assert!(config.is_default_dbpath());
        config.dbpath = PathBuf::from("/tmp/testdb");
        assert!(!config.is_default_dbpath());
    }
}
