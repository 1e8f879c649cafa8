//! Canary queries for individual rpmdb indexes.
//!
//! Each entry pairs one index file with an rpm invocation whose output shape
//! is known in advance and an ordered list of named predicates over the
//! completed command. Indexes without a canary here (Dirnames, Group, Name,
//! Installtid, the rarely-used trigger indexes, ...) are never probed.

use crate::exec::{status_code, CompletedCommand};

pub type Predicate = fn(&CompletedCommand) -> bool;

pub struct NamedCheck {
    pub name: &'static str,
    pub check: Predicate,
}

pub struct Canary {
    /// Index file name under the dbpath, e.g. "Providename".
    pub index: &'static str,
    /// Argument template; `{rpm}` expands to the rpm tool path. The
    /// `--dbpath` argument is appended by the caller.
    pub args: &'static [&'static str],
    pub checks: &'static [NamedCheck],
}

impl Canary {
    pub fn argv(&self, rpm_path: &str, dbpath: &str) -> Vec<String> {
        let mut argv = vec![rpm_path.to_string()];
        for arg in self.args {
            if *arg == "{rpm}" {
                argv.push(rpm_path.to_string());
            } else {
                argv.push(arg.to_string());
            }
        }
        argv.push("--dbpath".to_string());
        argv.push(dbpath.to_string());
        argv
    }
}

fn not_crashed(cc: &CompletedCommand) -> bool {
    cc.exit_code != status_code::SEGFAULT
}

fn exactly_one_line(cc: &CompletedCommand) -> bool {
    cc.stdout_lines().count() == 1
}

fn first_line_is_rpm(cc: &CompletedCommand) -> bool {
    cc.stdout_lines().next().is_some_and(|l| l.starts_with("rpm-"))
}

fn any_line_is_rpm(cc: &CompletedCommand) -> bool {
    cc.stdout_lines().any(|l| l.starts_with("rpm-"))
}

fn more_than_three_lines(cc: &CompletedCommand) -> bool {
    cc.stdout_lines().count() > 3
}

fn more_than_two_lines(cc: &CompletedCommand) -> bool {
    cc.stdout_lines().count() > 2
}

fn at_least_two_lines(cc: &CompletedCommand) -> bool {
    cc.stdout_lines().count() >= 2
}

fn at_least_one_line(cc: &CompletedCommand) -> bool {
    cc.stdout_lines().count() >= 1
}

/// Canaries that hold on CentOS/RHEL-style hosts.
pub const BASE_CANARIES: &[Canary] = &[
    Canary {
        // Querying which package owns the rpm binary exercises Basenames.
        index: "Basenames",
        args: &["-qf", "{rpm}"],
        checks: &[
            NamedCheck { name: "not_crashed", check: not_crashed },
            NamedCheck { name: "exactly_one_line", check: exactly_one_line },
            NamedCheck { name: "first_line_is_rpm", check: first_line_is_rpm },
        ],
    },
    Canary {
        index: "Conflictname",
        args: &["-q", "--conflicts", "initscripts"],
        checks: &[
            NamedCheck { name: "not_crashed", check: not_crashed },
            NamedCheck { name: "more_than_three_lines", check: more_than_three_lines },
        ],
    },
    Canary {
        index: "Obsoletename",
        args: &["-q", "--obsoletes", "coreutils"],
        checks: &[
            NamedCheck { name: "not_crashed", check: not_crashed },
            NamedCheck { name: "more_than_two_lines", check: more_than_two_lines },
        ],
    },
    Canary {
        index: "Providename",
        args: &["-q", "--whatprovides", "rpm"],
        checks: &[
            NamedCheck { name: "not_crashed", check: not_crashed },
            NamedCheck { name: "exactly_one_line", check: exactly_one_line },
            NamedCheck { name: "first_line_is_rpm", check: first_line_is_rpm },
        ],
    },
    Canary {
        index: "Requirename",
        args: &["-q", "--whatrequires", "rpm"],
        checks: &[
            NamedCheck { name: "not_crashed", check: not_crashed },
            NamedCheck { name: "at_least_one_line", check: at_least_one_line },
            NamedCheck { name: "any_line_is_rpm", check: any_line_is_rpm },
        ],
    },
];

/// Fedora deviates from CentOS in two ways: initscripts carries no
/// conflicting capabilities (systemd does, but only two), and coreutils
/// only obsoletes older versions of itself.
pub const FEDORA_OVERRIDES: &[Canary] = &[
    Canary {
        index: "Conflictname",
        args: &["-q", "--conflicts", "systemd"],
        checks: &[
            NamedCheck { name: "not_crashed", check: not_crashed },
            NamedCheck { name: "at_least_two_lines", check: at_least_two_lines },
        ],
    },
    Canary {
        index: "Obsoletename",
        args: &["-q", "--obsoletes", "coreutils"],
        checks: &[
            NamedCheck { name: "not_crashed", check: not_crashed },
            NamedCheck { name: "at_least_one_line", check: at_least_one_line },
        ],
    },
];

/// The canary set for a given /etc/os-release ID, with platform overrides
/// replacing the base entry for the same index.
pub fn canaries_for(os_id: &str) -> Vec<&'static Canary> {
    BASE_CANARIES
        .iter()
        .map(|base| {
            if os_id == "fedora" {
                if let Some(over) = FEDORA_OVERRIDES.iter().find(|o| o.index == base.index) {
                    return over;
                }
            }
            base
        })
        .collect()
}
