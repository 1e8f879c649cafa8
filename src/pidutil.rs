//! Lock-holder discovery and process reclamation.
//!
//! Discovery walks `/proc` and compares file-descriptor inodes, so it finds
//! holders of an inode even after the original path has been unlinked (which
//! is exactly what recovery needs — db_recover destroys `__db.001` but the
//! processes that had it open keep the inode alive). A process that vanishes
//! mid-scan is simply not a holder; the scan tolerates a moving target.
//!
//! An `lsof`-based scanner is available as an alternative for hosts where
//! `/proc` inspection is restricted.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use tokio::time::Instant;

use crate::error::validate_pid;
use crate::exec::{self, RunOptions};

/// Hard safety floor: never signal init/kernel processes. Not configurable.
pub const MIN_PID: u32 = 2;

/// Default per-process reap timeout after a signal is sent.
pub const DEFAULT_SIGNAL_TIMEOUT: Duration = Duration::from_secs(5);

const LSOF_TIMEOUT: Duration = Duration::from_secs(10);
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A live process holding a given file open. Looked up fresh on every
/// reclamation attempt; never cached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockHolder {
    pub pid: u32,
    pub command_name: String,
}

/// Seam between the recovery procedure and the host: tests substitute mock
/// holder sets and record which signals would have been sent.
#[async_trait]
pub trait Reclaimer: Send + Sync {
    /// All live processes with `path`'s inode open. Empty set on any
    /// discovery problem; discovery failures are never fatal.
    async fn holders_of(&self, path: &Path) -> HashSet<LockHolder>;

    /// Signals every holder and waits for each to be reaped. True iff at
    /// least one holder was successfully signaled and reaped.
    async fn signal_holders(
        &self,
        holders: &HashSet<LockHolder>,
        sig: Signal,
        timeout: Duration,
    ) -> bool;
}

/// Default reclaimer: scans `/proc` directly.
pub struct ProcScanner;

#[async_trait]
impl Reclaimer for ProcScanner {
    async fn holders_of(&self, path: &Path) -> HashSet<LockHolder> {
        procs_holding_file(path)
    }

    async fn signal_holders(
        &self,
        holders: &HashSet<LockHolder>,
        sig: Signal,
        timeout: Duration,
    ) -> bool {
        send_signals(holders, sig, timeout).await
    }
}

/// Reclaimer that delegates holder discovery to an external `lsof` binary.
pub struct LsofScanner {
    lsof_path: String,
}

impl LsofScanner {
    pub fn new(lsof_path: String) -> Self {
        Self { lsof_path }
    }
}

#[async_trait]
impl Reclaimer for LsofScanner {
    async fn holders_of(&self, path: &Path) -> HashSet<LockHolder> {
        procs_holding_file_lsof(&self.lsof_path, path).await
    }

    async fn signal_holders(
        &self,
        holders: &HashSet<LockHolder>,
        sig: Signal,
        timeout: Duration,
    ) -> bool {
        send_signals(holders, sig, timeout).await
    }
}

/// All PIDs currently visible in `/proc`.
pub fn live_pids() -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
        .collect()
}

/// Command name of a process, from `/proc/<pid>/comm`.
pub fn comm_of(pid: u32) -> Option<String> {
    std::fs::read_to_string(format!("/proc/{pid}/comm"))
        .ok()
        .map(|s| s.trim().to_string())
}

/// Full command line of a process, NUL-split from `/proc/<pid>/cmdline`.
pub fn cmdline_of(pid: u32) -> Option<Vec<String>> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let args: Vec<String> = raw
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect();
    if args.is_empty() {
        None
    } else {
        Some(args)
    }
}

pub fn is_pid_alive(pid: u32) -> bool {
    let Ok(nix_pid) = validate_pid(pid) else {
        return false;
    };
    signal::kill(nix_pid, None).is_ok()
}

/// Query the kernel clock tick rate (jiffies per second) at runtime.
///
/// Falls back to 100 (the common default) if sysconf fails.
fn clock_ticks_per_sec() -> u64 {
    nix::unistd::sysconf(nix::unistd::SysconfVar::CLK_TCK)
        .ok()
        .flatten()
        .map(|v| v as u64)
        .unwrap_or(100)
}

/// How long a process has been running, from `/proc/<pid>/stat` starttime
/// and `/proc/uptime`. None if the process is gone or the fields are
/// unreadable.
pub fn process_age(pid: u32) -> Option<Duration> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The comm field is in parens and can contain spaces; parse from the
    // closing paren.
    let close_paren = stat.rfind(')')?;
    let fields: Vec<&str> = stat[close_paren + 2..].split_whitespace().collect();
    let starttime_jiffies: u64 = fields.get(19)?.parse().ok()?;

    let uptime = std::fs::read_to_string("/proc/uptime").ok()?;
    let uptime_secs: f64 = uptime.split_whitespace().next()?.parse().ok()?;

    let age = uptime_secs - (starttime_jiffies as f64 / clock_ticks_per_sec() as f64);
    if age <= 0.0 {
        return Some(Duration::ZERO);
    }
    Some(Duration::from_secs_f64(age))
}

/// Returns the set of processes holding `path`'s inode open.
///
/// Comparison is by (device, inode) of each `/proc/<pid>/fd` entry, not by
/// symlink text, so holders are found even after rename or unlink of the
/// original path.
pub fn procs_holding_file(path: &Path) -> HashSet<LockHolder> {
    use std::os::unix::fs::MetadataExt;

    let mut holders = HashSet::new();
    let Ok(target) = std::fs::metadata(path) else {
        return holders;
    };
    let (dev, ino) = (target.dev(), target.ino());

    for pid in live_pids() {
        let Ok(entries) = std::fs::read_dir(format!("/proc/{pid}/fd")) else {
            // Gone already, or not ours to inspect. Not a holder.
            continue;
        };
        for entry in entries.flatten() {
            let Ok(meta) = std::fs::metadata(entry.path()) else {
                continue;
            };
            if meta.dev() == dev && meta.ino() == ino {
                holders.insert(LockHolder {
                    pid,
                    command_name: comm_of(pid).unwrap_or_default(),
                });
                break;
            }
        }
    }
    holders
}

/// Holder discovery via `lsof -F pc`.
///
/// lsof exits nonzero both when nothing matched and when something went
/// wrong; the only signal distinguishing the two is stderr output, and it is
/// too coarse to act on. A nonzero exit with stderr is logged as a warning,
/// and either way the result is "no holders found".
pub async fn procs_holding_file_lsof(lsof_path: &str, path: &Path) -> HashSet<LockHolder> {
    let argv = vec![
        lsof_path.to_string(),
        "-F".to_string(),
        "pc".to_string(),
        "--".to_string(),
        path.display().to_string(),
    ];
    match exec::run_with_timeout(&argv, LSOF_TIMEOUT, RunOptions::best_effort()).await {
        Err(e) => {
            tracing::warn!("lsof failed to run: {}", e);
            HashSet::new()
        }
        Ok(cc) if cc.exit_code != 0 => {
            let stderr = cc.stderr.trim();
            if !stderr.is_empty() {
                tracing::warn!(
                    "lsof exited {} with stderr output: {}",
                    cc.exit_code,
                    stderr
                );
            }
            HashSet::new()
        }
        Ok(cc) => parse_lsof_field_output(&cc.stdout),
    }
}

/// Parses `lsof -F pc` field output: `p<pid>` lines start a process record,
/// `c<command>` lines complete it.
fn parse_lsof_field_output(output: &str) -> HashSet<LockHolder> {
    let mut holders = HashSet::new();
    let mut current_pid: Option<u32> = None;
    for line in output.lines() {
        if let Some(rest) = line.strip_prefix('p') {
            current_pid = rest.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix('c') {
            if let Some(pid) = current_pid {
                holders.insert(LockHolder {
                    pid,
                    command_name: rest.trim().to_string(),
                });
            }
        }
    }
    holders
}

/// Sends `sig` to one process and waits up to `timeout` for it to be reaped.
///
/// "Process no longer exists" and "wait timed out" are both non-fatal
/// per-process outcomes: logged, and reported as `false`.
pub async fn send_signal(pid: u32, sig: Signal, timeout: Duration) -> bool {
    // Don't accidentally signal core system processes.
    if pid < MIN_PID {
        tracing::warn!("Refusing to kill pid {}", pid);
        return false;
    }
    let nix_pid = match validate_pid(pid) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!("Not signaling pid {}: {}", pid, e);
            return false;
        }
    };

    tracing::info!("Sending signal {} to pid {}", sig, pid);
    match signal::kill(nix_pid, sig) {
        Err(nix::errno::Errno::ESRCH) => {
            tracing::debug!("Pid {} does not exist", pid);
            return false;
        }
        Err(e) => {
            tracing::warn!("Failed to signal pid {}: {}", pid, e);
            return false;
        }
        Ok(()) => {}
    }

    // Poll for the process to disappear. Its natural exit can race the
    // signal; either way "gone" is what we wanted.
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if signal::kill(nix_pid, None).is_err() {
            return true;
        }
        tokio::time::sleep(REAP_POLL_INTERVAL).await;
    }
    tracing::debug!("Timed out after {:?} waiting for pid {}", timeout, pid);
    false
}

/// Sends `sig` to every holder. True iff at least one was successfully
/// signaled and reaped; an empty holder set is `false` without raising.
pub async fn send_signals(holders: &HashSet<LockHolder>, sig: Signal, timeout: Duration) -> bool {
    let mut any = false;
    for holder in holders {
        if send_signal(holder.pid, sig, timeout).await {
            any = true;
        }
    }
    any
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn empty_holder_set_signals_nothing() {
        let holders = HashSet::new();
        assert!(!send_signals(&holders, Signal::SIGKILL, Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn refuses_to_signal_below_min_pid() {
        assert!(!send_signal(0, Signal::SIGKILL, Duration::from_millis(50)).await);
        assert!(!send_signal(1, Signal::SIGKILL, Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn nonexistent_pid_is_nonfatal_false() {
        // PID near the typical pid_max; almost certainly not alive.
        assert!(!send_signal(4_000_000, Signal::SIGTERM, Duration::from_millis(50)).await);
    }

    #[test]
    fn finds_ourselves_holding_an_open_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("held.lock");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"x").unwrap();

        let holders = procs_holding_file(&path);
        let me = std::process::id();
        assert!(
            holders.iter().any(|h| h.pid == me),
            "expected own pid {} in {:?}",
            me,
            holders
        );
    }

    #[test]
    fn finds_holder_of_unlinked_inode_via_hard_link() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("__db.001");
        let link = dir.path().join("inode_pointer");
        std::fs::write(&original, b"data").unwrap();
        let _held = std::fs::File::open(&original).unwrap();
        std::fs::hard_link(&original, &link).unwrap();
        std::fs::remove_file(&original).unwrap();

        let holders = procs_holding_file(&link);
        let me = std::process::id();
        assert!(holders.iter().any(|h| h.pid == me));
    }

    #[test]
    fn missing_file_has_no_holders() {
        assert!(procs_holding_file(Path::new("/nonexistent/file")).is_empty());
    }

    #[test]
    fn own_process_is_alive_and_aged() {
        let me = std::process::id();
        assert!(is_pid_alive(me));
        assert!(process_age(me).is_some());
    }

    #[test]
    fn own_cmdline_and_comm_are_readable() {
        let me = std::process::id();
        assert!(cmdline_of(me).is_some());
        assert!(comm_of(me).is_some());
    }

    #[test]
    fn lsof_field_output_parses_pid_command_pairs() {
        let out = "p123\ncyum\np456\ncrpm\n";
        let holders = parse_lsof_field_output(out);
        assert_eq!(holders.len(), 2);
        assert!(holders.contains(&LockHolder {
            pid: 123,
            command_name: "yum".to_string()
        }));
        assert!(holders.contains(&LockHolder {
            pid: 456,
            command_name: "rpm".to_string()
        }));
    }
}
