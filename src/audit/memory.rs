//! In-process audit sink for ephemeral runs and tests.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::audit::{AuditEntry, AuditSink};
use crate::core::errors::Result;

#[derive(Default)]
struct Rows {
    next_id: i64,
    progress: Vec<(i64, AuditEntry)>,
    alerts: Vec<(i64, AuditEntry)>,
}

/// Keeps every row in memory.
#[derive(Default)]
pub struct MemoryAuditSink {
    rows: Mutex<Rows>,
}

impl MemoryAuditSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the progress rows, oldest first.
    pub fn progress(&self) -> Vec<AuditEntry> {
        self.rows.lock().progress.iter().map(|(_, e)| e.clone()).collect()
    }

    /// Copy of the alert rows, oldest first.
    pub fn alerts(&self) -> Vec<AuditEntry> {
        self.rows.lock().alerts.iter().map(|(_, e)| e.clone()).collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn save_progress(&self, entry: &AuditEntry) -> Result<i64> {
        let mut rows = self.rows.lock();
        rows.next_id += 1;
        let id = rows.next_id;
        rows.progress.push((id, entry.clone()));
        Ok(id)
    }

    fn save_alert(&self, entry: &AuditEntry) -> Result<i64> {
        let mut rows = self.rows.lock();
        rows.next_id += 1;
        let id = rows.next_id;
        rows.alerts.push((id, entry.clone()));
        Ok(id)
    }

    fn clear_progress(&self) -> Result<usize> {
        let mut rows = self.rows.lock();
        let removed = rows.progress.len();
        rows.progress.clear();
        Ok(removed)
    }

    fn prune_progress_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut rows = self.rows.lock();
        let before = rows.progress.len();
        rows.progress.retain(|(_, e)| e.execution_time >= cutoff);
        Ok(before - rows.progress.len())
    }
}
