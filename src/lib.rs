//! # rpmdb-doctor
//!
//! A diagnose-and-repair tool for RPM database corruption.
//!
//! The RPM database sits on a transactional Berkeley DB environment that can
//! be wedged by crashed transactions, stale locks, spinning readers, or
//! outright table corruption. This crate runs a battery of cheap diagnostics
//! against the database and dispatches the narrowest repair that clears the
//! detected problem, retrying for a bounded number of passes:
//!
//! - **Index rebuild**: delete one corrupt derived index and let rpm
//!   regenerate it lazily.
//! - **Recovery**: replay the environment's transaction log (`db_recover`),
//!   after clearing processes holding the environment's lock files.
//! - **Rebuild**: regenerate every table from the canonical package metadata
//!   (`rpm --rebuilddb`), the heaviest hammer.
//!
//! Every repair that is dispatched lands in an ordered [`report::ActionLog`]
//! so telemetry consumers can see exactly what was done without parsing
//! free-text logs.
//!
//! ## Quick start
//!
//! ```no_run
//! use rpmdb_doctor::{Config, Doctor};
//!
//! # async fn example() -> rpmdb_doctor::Result<()> {
//! let mut doctor = Doctor::new(Config::default())?;
//! let healthy = doctor.run().await?;
//! for action in doctor.actions().names() {
//!     println!("repaired: {action}");
//! }
//! # let _ = healthy;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod doctor;
pub mod error;
pub mod exec;
pub mod forensic;
pub mod pidutil;
pub mod report;
pub mod rpmdb;
pub mod yum;

// Re-export commonly used types
pub use config::{which, Config};
pub use doctor::Doctor;
pub use error::{Error, Result};
pub use report::{ActionLog, Diagnosis, RecoveryOutcome, RepairAction};
pub use rpmdb::{DbAdapter, RpmDb};
