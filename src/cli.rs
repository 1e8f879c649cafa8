use std::path::PathBuf;

use clap::Parser;

use rpmdb_doctor::config::{self, Config, DEFAULT_MAX_PASSES, DEFAULT_MIN_FREE_SPACE};
use rpmdb_doctor::Result;

#[derive(Parser)]
#[command(name = "rpmdb-doctor")]
#[command(about = "Detect and correct RPM database corruption", version)]
pub struct Cli {
    /// Path to the RPM database directory
    #[arg(long, default_value = "/var/lib/rpm")]
    pub dbpath: PathBuf,

    /// Log intended repairs without performing them
    #[arg(long)]
    pub dry_run: bool,

    /// Maximum number of diagnose-repair passes
    #[arg(long, default_value_t = DEFAULT_MAX_PASSES)]
    pub max_passes: u32,

    /// Minimum free bytes required on the dbpath filesystem
    #[arg(long, default_value_t = DEFAULT_MIN_FREE_SPACE)]
    pub minspace: u64,

    /// Tables to skip during per-table verification (can be repeated)
    #[arg(long = "blacklist")]
    pub blacklist: Vec<String>,

    /// Capture verbose tool output to timestamped files for later analysis
    #[arg(long)]
    pub forensic: bool,

    /// Directory for forensic captures
    #[arg(long, default_value = "/tmp")]
    pub forensic_dir: PathBuf,

    /// Check for (and kill) a yum process stuck behind a stale pidfile
    #[arg(long)]
    pub check_stuck_yum: bool,

    /// Clean up stale yum transaction artifacts before diagnosing
    #[arg(long)]
    pub clean_yum_transactions: bool,

    /// Run `yum check dependencies` as part of each pass
    #[arg(long)]
    pub run_yum_check: bool,

    /// Run `yum clean expire-cache` as part of each pass
    #[arg(long)]
    pub run_yum_clean: bool,

    /// Discover lock holders with lsof instead of scanning /proc
    #[arg(long)]
    pub use_lsof: bool,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    pub logfile: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    // Tool path overrides. Bare names are resolved on PATH at startup.
    #[arg(long, default_value = "rpm")]
    pub rpm_path: String,

    #[arg(long, default_value = "db_recover")]
    pub recover_path: String,

    #[arg(long, default_value = "db_verify")]
    pub verify_path: String,

    #[arg(long, default_value = "db_stat")]
    pub stat_path: String,

    #[arg(long, default_value = "yum")]
    pub yum_path: String,

    #[arg(long, default_value = "/usr/sbin/yum-complete-transaction")]
    pub yum_complete_transaction_path: String,

    #[arg(long, default_value = "lsof")]
    pub lsof_path: String,
}

impl Cli {
    /// Resolves tool paths and folds the flags into a [`Config`]. Tools that
    /// are only needed for an enabled feature are only resolved (and
    /// required to exist) when that feature is on.
    pub fn into_config(self) -> Result<Config> {
        let defaults = Config::default();
        let config = Config {
            rpm_path: config::which(&self.rpm_path)?,
            recover_path: config::which(&self.recover_path)?,
            verify_path: config::which(&self.verify_path)?,
            stat_path: if self.forensic {
                config::which(&self.stat_path)?
            } else {
                self.stat_path
            },
            yum_path: if self.run_yum_check || self.run_yum_clean || self.check_stuck_yum {
                config::which(&self.yum_path)?
            } else {
                self.yum_path
            },
            yum_complete_transaction_path: if self.clean_yum_transactions {
                config::which(&self.yum_complete_transaction_path)?
            } else {
                self.yum_complete_transaction_path
            },
            lsof_path: if self.use_lsof {
                config::which(&self.lsof_path)?
            } else {
                self.lsof_path
            },
            dbpath: self.dbpath,
            blacklist: if self.blacklist.is_empty() {
                defaults.blacklist
            } else {
                self.blacklist
            },
            dry_run: self.dry_run,
            forensic: self.forensic,
            forensic_dir: self.forensic_dir,
            max_passes: self.max_passes,
            min_free_space: self.minspace,
            check_stuck_yum: self.check_stuck_yum,
            clean_yum_transactions: self.clean_yum_transactions,
            run_yum_check: self.run_yum_check,
            run_yum_clean: self.run_yum_clean,
            use_lsof: self.use_lsof,
            yum_transactions_dir: defaults.yum_transactions_dir,
        };
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_production_values() {
        let cli = Cli::parse_from(["rpmdb-doctor"]);
        assert_eq!(cli.dbpath, PathBuf::from("/var/lib/rpm"));
        assert_eq!(cli.max_passes, 5);
        assert_eq!(cli.minspace, 150 * 1048576);
        assert!(!cli.dry_run);
    }

    #[test]
    fn blacklist_can_be_repeated() {
        let cli = Cli::parse_from([
            "rpmdb-doctor",
            "--blacklist",
            "Filedigests",
            "--blacklist",
            "Sha1header",
        ]);
        assert_eq!(cli.blacklist, vec!["Filedigests", "Sha1header"]);
    }

    #[test]
    fn empty_blacklist_falls_back_to_defaults() {
        let cli = Cli::parse_from(["rpmdb-doctor", "--rpm-path", "/bin/sh"]);
        // sh stands in for every strictly-resolved tool so the fold succeeds
        // on any host.
        let cli = Cli {
            recover_path: "/bin/sh".to_string(),
            verify_path: "/bin/sh".to_string(),
            ..cli
        };
        let config = cli.into_config().unwrap();
        assert!(config.blacklist.contains(&"Filedigests".to_string()));
    }
}
