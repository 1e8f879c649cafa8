//! Forensic capture sink.
//!
//! When forensic mode is on, full verbose tool output is written to
//! timestamped files so a wedged environment can be investigated after the
//! fact. Capture failures are logged and swallowed — forensics must never
//! affect the repair run.

use std::path::PathBuf;

use chrono::Local;

#[derive(Debug, Clone)]
pub struct ForensicSink {
    logdir: PathBuf,
}

impl ForensicSink {
    pub fn new(logdir: PathBuf) -> Self {
        Self { logdir }
    }

    /// Writes `contents` to `<logdir>/<key>.<yyyymmddhhmmss>.txt`.
    pub fn capture(&self, key: &str, contents: &str) {
        let stamp = Local::now().format("%Y%m%d%H%M%S");
        let path = self.logdir.join(format!("{key}.{stamp}.txt"));
        if let Err(e) = std::fs::write(&path, contents) {
            tracing::warn!("Failed to write forensic capture {}: {}", path.display(), e);
        } else {
            tracing::debug!("Wrote forensic capture to {}", path.display());
        }
    }
}
