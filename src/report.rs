//! Typed diagnostic outcomes and the structured repair-action log.
//!
//! Diagnostics never signal corruption through errors; they return a
//! [`Diagnosis`] value and the controller pattern-matches on it. The action
//! log is the primary observability surface: an ordered record of every
//! repair that was actually dispatched, enumerable without parsing logs.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Outcome of one diagnostic step. Exactly one diagnosis is active per step;
/// the first non-healthy diagnosis short-circuits the rest of the pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnosis {
    /// No action needed.
    Healthy,
    /// The transactional log/environment is inconsistent; run db_recover.
    NeedsRecovery,
    /// Table contents are inconsistent with the package index; run a full
    /// rebuild.
    NeedsRebuild,
    /// An operation failed for an unclassified reason; abandon the pass and
    /// retry from the top.
    Failure(String),
}

impl Diagnosis {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Diagnosis::Healthy)
    }
}

/// Result of the recovery procedure, consumed by the controller to decide
/// whether a rebuild must follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Dry-run mode; nothing was touched.
    Skipped,
    /// A lock-file holder was killed; the workload is expected to self-heal
    /// on next use, so the recovery tool was not run.
    LockHoldersKilled,
    /// db_recover ran and exited zero.
    Recovered,
    /// db_recover crashed; only a full rebuild can proceed.
    RebuildRequired,
}

/// Every repair this tool can perform, recorded for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepairAction {
    NoAction,
    DbRecovery,
    TableRebuild,
    KillLockPids,
    KillDb001Pids,
    IndexRebuild,
    StuckYum,
    CleanYumTransactions,
}

impl RepairAction {
    /// Stable human-readable name, used by telemetry consumers.
    pub fn name(self) -> &'static str {
        match self {
            RepairAction::NoAction => "no_action",
            RepairAction::DbRecovery => "db_recovery",
            RepairAction::TableRebuild => "table_rebuild",
            RepairAction::KillLockPids => "kill_lock_pids",
            RepairAction::KillDb001Pids => "kill_db001_pids",
            RepairAction::IndexRebuild => "index_rebuild",
            RepairAction::StuckYum => "stuck_yum",
            RepairAction::CleanYumTransactions => "cleanup_yum_transactions",
        }
    }
}

impl fmt::Display for RepairAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shared, ordered record of dispatched repairs.
///
/// An action is recorded when the corresponding repair command is actually
/// dispatched, never when it is merely decided upon, so the log reflects
/// real side effects. Cloning is cheap; all clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct ActionLog {
    inner: Arc<Mutex<Vec<RepairAction>>>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, action: RepairAction) {
        tracing::info!(action = action.name(), "repair action dispatched");
        self.inner.lock().push(action);
    }

    pub fn actions(&self) -> Vec<RepairAction> {
        self.inner.lock().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.inner.lock().iter().map(|a| a.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
