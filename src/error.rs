use miette::Diagnostic;
use std::io;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("'{command}' timed out after {timeout_secs}s")]
    #[diagnostic(
        code(doctor::exec::timeout),
        help("The tool hung past its deadline and was terminated. Re-running usually works; if it keeps hanging, the database environment is likely wedged")
    )]
    CommandTimeout { command: String, timeout_secs: u64 },

    #[error("'{command}' returned nonzero exit code ({code})")]
    #[diagnostic(code(doctor::exec::nonzero))]
    CommandFailed { command: String, code: i32 },

    #[error("Failed to spawn '{command}': {source}")]
    #[diagnostic(
        code(doctor::exec::spawn),
        help("Check that the tool exists and is executable, or pass an explicit path on the command line")
    )]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("db_recover returned nonzero exit code ({code}): {stderr}")]
    #[diagnostic(
        code(doctor::recovery::failed),
        help("Recovery itself is failing. A full `rpm --rebuilddb` may be the only way forward")
    )]
    RecoveryFailed { code: i32, stderr: String },

    #[error("Could not hard-link {src} to {dst}: {source}")]
    #[diagnostic(
        code(doctor::recovery::link_failed),
        help("db_recover destroys __db.001; recovery cannot proceed without the inode safety net")
    )]
    HardLinkFailed {
        src: String,
        dst: String,
        #[source]
        source: io::Error,
    },

    #[error("Tool not found on PATH: {0}")]
    #[diagnostic(
        code(doctor::config::tool_missing),
        help("Install the tool or point at it explicitly, e.g. --recover-path /usr/bin/db_recover")
    )]
    ToolNotFound(String),

    #[error("Invalid PID {pid}: {reason}")]
    InvalidPid { pid: u32, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Validates and converts a u32 PID to nix::unistd::Pid safely.
/// Returns Err for PID 0 (process group), PID 1 (init), or values > i32::MAX.
pub fn validate_pid(pid: u32) -> Result<nix::unistd::Pid> {
    if pid == 0 {
        return Err(Error::InvalidPid {
            pid,
            reason: "PID 0 refers to a process group, not a process".to_string(),
        });
    }
    if pid == 1 {
        return Err(Error::InvalidPid {
            pid,
            reason: "refusing to operate on PID 1 (init)".to_string(),
        });
    }
    if pid > i32::MAX as u32 {
        return Err(Error::InvalidPid {
            pid,
            reason: format!("PID {} exceeds i32::MAX, cannot convert safely", pid),
        });
    }
    Ok(nix::unistd::Pid::from_raw(pid as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_zero_rejected() {
        assert!(validate_pid(0).is_err());
    }

    #[test]
    fn pid_one_rejected() {
        assert!(validate_pid(1).is_err());
    }

    #[test]
    fn pid_overflow_rejected() {
        let err = validate_pid(i32::MAX as u32 + 1).unwrap_err();
        assert!(err.to_string().contains("i32::MAX"), "got: {}", err);
    }

    #[test]
    fn normal_pid_accepted() {
        let pid = validate_pid(4242).unwrap();
        assert_eq!(pid.as_raw(), 4242);
    }
}
