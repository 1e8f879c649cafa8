//! Bounded external command execution.
//!
//! Every external tool this crate touches goes through [`run_with_timeout`]:
//! one command, one hard wall-clock deadline, captured output. A command
//! that outlives its deadline is ended kindly — SIGTERM, a short grace
//! period, then SIGKILL with the same grace period — so a hung diagnostic
//! can never wedge the whole run or leave a stray child behind.
//!
//! There are no retries here; retrying is the controller's job.

use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Grace period granted after each termination signal before escalating.
const END_GRACE: Duration = Duration::from_secs(5);

/// Exit codes with special meaning for repair decisions.
pub mod status_code {
    pub const SUCCESS: i32 = 0;
    /// Terminated by SIGSEGV, encoded with the negative-signal convention.
    /// A crashing tool implies a different repair than a failing one.
    pub const SEGFAULT: i32 = -11;
}

/// Immutable result of one external command invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletedCommand {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

impl CompletedCommand {
    /// Whether the process was killed by a fatal signal rather than exiting.
    pub fn crashed(&self) -> bool {
        !self.timed_out && self.exit_code < 0
    }

    pub fn stdout_lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines()
    }

    pub fn stderr_lines(&self) -> impl Iterator<Item = &str> {
        self.stderr.lines()
    }
}

/// Caller preferences for how command failures surface.
///
/// Some callers treat a timeout or a nonzero exit as a soft outcome to be
/// classified from the returned [`CompletedCommand`]; others want an error.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub raise_on_nonzero: bool,
    pub raise_on_timeout: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            raise_on_nonzero: true,
            raise_on_timeout: true,
        }
    }
}

impl RunOptions {
    /// Nonzero exits are reported in the result instead of raised.
    pub fn tolerate_nonzero() -> Self {
        Self {
            raise_on_nonzero: false,
            raise_on_timeout: true,
        }
    }

    /// Neither nonzero exits nor timeouts raise.
    pub fn best_effort() -> Self {
        Self {
            raise_on_nonzero: false,
            raise_on_timeout: false,
        }
    }
}

/// Runs `argv` with a hard deadline of `timeout`.
///
/// On timeout the process is terminated (SIGTERM, then SIGKILL) and, per
/// `options`, either an [`Error::CommandTimeout`] is returned or a
/// [`CompletedCommand`] with empty output, the best-effort exit status and
/// `timed_out` set. On normal completion a nonzero exit either raises
/// [`Error::CommandFailed`] or is reported in the result.
///
/// An empty `argv` is a programming error and panics.
pub async fn run_with_timeout(
    argv: &[String],
    timeout: Duration,
    options: RunOptions,
) -> Result<CompletedCommand> {
    assert!(!argv.is_empty(), "empty command line");
    let cmdname = argv[0].clone();
    tracing::debug!(command = ?argv, ?timeout, "running external command");

    let mut child = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| Error::Spawn {
            command: cmdname.clone(),
            source,
        })?;

    // Drain the pipes concurrently with the wait so a chatty child can
    // never fill a pipe buffer and deadlock against us.
    let stdout_task = spawn_reader(child.stdout.take());
    let stderr_task = spawn_reader(child.stderr.take());

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            let exit_code = exit_code_of(status);
            let stdout = join_reader(stdout_task).await;
            let stderr = join_reader(stderr_task).await;
            if options.raise_on_nonzero && exit_code != status_code::SUCCESS {
                tracing::error!(
                    command = %cmdname,
                    exit_code,
                    "command returned nonzero exit code"
                );
                return Err(Error::CommandFailed {
                    command: cmdname,
                    code: exit_code,
                });
            }
            Ok(CompletedCommand {
                stdout,
                stderr,
                exit_code,
                timed_out: false,
            })
        }
        Ok(Err(source)) => Err(Error::Io(source)),
        Err(_elapsed) => {
            tracing::error!(command = %cmdname, ?timeout, "command timed out");
            let exit_code = end_kindly(&mut child).await;
            if let Some(task) = stdout_task {
                task.abort();
            }
            if let Some(task) = stderr_task {
                task.abort();
            }
            if options.raise_on_timeout {
                Err(Error::CommandTimeout {
                    command: cmdname,
                    timeout_secs: timeout.as_secs(),
                })
            } else {
                Ok(CompletedCommand {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code,
                    timed_out: true,
                })
            }
        }
    }
}

fn spawn_reader<R>(pipe: Option<R>) -> Option<JoinHandle<String>>
where
    R: AsyncReadExt + Unpin + Send + 'static,
{
    pipe.map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

async fn join_reader(task: Option<JoinHandle<String>>) -> String {
    match task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    }
}

/// Maps an exit status to the negative-signal sentinel convention:
/// normal exits keep their code, signal deaths become `-signo`.
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| -s))
        .unwrap_or(-1)
}

/// Tries to nicely end a timed-out child: SIGTERM first and, if it is still
/// running after the grace period, SIGKILL. The forceful path is attempted
/// unconditionally when the graceful one fails to reap — a zombie left
/// behind is worse than an impolite signal. Returns the best-effort exit
/// status.
async fn end_kindly(child: &mut Child) -> i32 {
    let Some(raw_pid) = child.id() else {
        // Already exited between the deadline firing and now.
        return child
            .try_wait()
            .ok()
            .flatten()
            .map(exit_code_of)
            .unwrap_or(-1);
    };
    let pid = nix::unistd::Pid::from_raw(raw_pid as i32);

    tracing::info!("Sending SIGTERM to {}", raw_pid);
    let _ = signal::kill(pid, Signal::SIGTERM);
    if let Ok(Ok(status)) = tokio::time::timeout(END_GRACE, child.wait()).await {
        return exit_code_of(status);
    }

    tracing::warn!("Could not SIGTERM {}, sending SIGKILL", raw_pid);
    let _ = signal::kill(pid, Signal::SIGKILL);
    match tokio::time::timeout(END_GRACE, child.wait()).await {
        Ok(Ok(status)) => exit_code_of(status),
        _ => {
            tracing::error!("Could not SIGKILL {}, good luck", raw_pid);
            -1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let cc = run_with_timeout(
            &argv(&["/bin/sh", "-c", "echo hello; echo oops >&2"]),
            Duration::from_secs(5),
            RunOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(cc.stdout.trim(), "hello");
        assert_eq!(cc.stderr.trim(), "oops");
        assert_eq!(cc.exit_code, 0);
        assert!(!cc.timed_out);
    }

    #[tokio::test]
    async fn nonzero_raises_by_default() {
        let err = run_with_timeout(
            &argv(&["/bin/sh", "-c", "exit 3"]),
            Duration::from_secs(5),
            RunOptions::default(),
        )
        .await
        .unwrap_err();
        match err {
            Error::CommandFailed { code, .. } => assert_eq!(code, 3),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn nonzero_tolerated_when_asked() {
        let cc = run_with_timeout(
            &argv(&["/bin/sh", "-c", "exit 3"]),
            Duration::from_secs(5),
            RunOptions::tolerate_nonzero(),
        )
        .await
        .unwrap();
        assert_eq!(cc.exit_code, 3);
    }

    #[tokio::test]
    async fn signal_death_uses_negative_sentinel() {
        let cc = run_with_timeout(
            &argv(&["/bin/sh", "-c", "kill -11 $$"]),
            Duration::from_secs(5),
            RunOptions::tolerate_nonzero(),
        )
        .await
        .unwrap();
        assert_eq!(cc.exit_code, status_code::SEGFAULT);
        assert!(cc.crashed());
    }

    #[tokio::test]
    async fn timeout_raises_by_default() {
        let err = run_with_timeout(
            &argv(&["/bin/sleep", "60"]),
            Duration::from_millis(200),
            RunOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::CommandTimeout { .. }));
    }

    #[tokio::test]
    async fn timeout_soft_mode_reports_timed_out() {
        let cc = run_with_timeout(
            &argv(&["/bin/sleep", "60"]),
            Duration::from_millis(200),
            RunOptions::best_effort(),
        )
        .await
        .unwrap();
        assert!(cc.timed_out);
        assert!(cc.stdout.is_empty());
        assert!(cc.stderr.is_empty());
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let err = run_with_timeout(
            &argv(&["/nonexistent/surely-not-a-tool"]),
            Duration::from_secs(1),
            RunOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }

    #[tokio::test]
    #[should_panic(expected = "empty command line")]
    async fn empty_argv_is_a_programming_error() {
        let _ = run_with_timeout(&[], Duration::from_secs(1), RunOptions::default()).await;
    }
}
