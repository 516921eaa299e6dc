//! Audit trail of rule executions.
//!
//! Two kinds of rows are written through an [`AuditSink`]: progress rows for
//! every audited rule pass (only while progress capture is switched on) and
//! alert rows whenever an alert-level rule actually fired. Persistence
//! failures are counted and logged; they never reach rule evaluation.

#![allow(missing_docs)]

pub mod manifest;
pub mod memory;
pub mod recorder;
pub mod snapshot;
#[cfg(feature = "sqlite")]
pub mod store;
pub mod types;

use chrono::{DateTime, Utc};

use crate::core::errors::Result;

pub use manifest::{AuditManifest, RuleMeta};
pub use memory::MemoryAuditSink;
pub use recorder::{AuditListener, AuditRecorder};
pub use snapshot::{extract_snapshot, filter_snapshot};
#[cfg(feature = "sqlite")]
pub use store::SqliteAuditStore;
pub use types::{AuditEntry, GridPage, PageRequest, ProgressStatus, SortOrder};

/// Destination for audit rows.
pub trait AuditSink: Send + Sync {
    /// Persist a progress row; returns its id.
    fn save_progress(&self, entry: &AuditEntry) -> Result<i64>;

    /// Persist a fired alert and refresh the device rollup; returns the id.
    fn save_alert(&self, entry: &AuditEntry) -> Result<i64>;

    /// Delete every progress row. Returns how many were removed.
    fn clear_progress(&self) -> Result<usize>;

    /// Delete progress rows older than `cutoff`.
    fn prune_progress_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}
