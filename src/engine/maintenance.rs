//! Periodic housekeeping: idle buffer eviction, geofence cache purge and
//! progress-audit retention.

#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use serde::Serialize;

use crate::audit::AuditSink;
use crate::capabilities::{BufferManager, GeofenceCapability};
use crate::core::errors::{FreError, Result};

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub buffers_evicted: usize,
    pub geofence_groups_purged: usize,
    pub audit_rows_pruned: usize,
}

pub struct Maintenance {
    buffers: Arc<BufferManager>,
    geofence: Arc<GeofenceCapability>,
    audit: Option<Arc<dyn AuditSink>>,
    retention_days: u64,
}

impl Maintenance {
    pub fn new(buffers: Arc<BufferManager>, geofence: Arc<GeofenceCapability>) -> Self {
        Self {
            buffers,
            geofence,
            audit: None,
            retention_days: 0,
        }
    }

    /// Prune progress rows older than `retention_days`; 0 keeps everything.
    #[must_use]
    pub fn with_audit_retention(mut self, sink: Arc<dyn AuditSink>, retention_days: u64) -> Self {
        self.audit = Some(sink);
        self.retention_days = retention_days;
        self
    }

    pub fn run_once(&self) -> SweepReport {
        let mut report = SweepReport {
            buffers_evicted: self.buffers.sweep_idle(),
            geofence_groups_purged: self.geofence.purge_expired(),
            audit_rows_pruned: 0,
        };
        if let Some(sink) = self.audit.as_ref().filter(|_| self.retention_days > 0) {
            let days = i64::try_from(self.retention_days).unwrap_or(i64::MAX / 86_400);
            let cutoff = Utc::now() - TimeDelta::days(days);
            match sink.prune_progress_before(cutoff) {
                Ok(pruned) => report.audit_rows_pruned = pruned,
                Err(error) => tracing::warn!(%error, "audit retention prune failed"),
            }
        }
        if report != SweepReport::default() {
            tracing::info!(
                buffers = report.buffers_evicted,
                geofence_groups = report.geofence_groups_purged,
                audit_rows = report.audit_rows_pruned,
                "maintenance sweep"
            );
        }
        report
    }

    /// Run [`Self::run_once`] every `interval` until the handle is shut down.
    pub fn spawn(self, interval: Duration) -> Result<MaintenanceHandle> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let join = thread::Builder::new()
            .name("fre-maintenance".to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            self.run_once();
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .map_err(|e| FreError::Runtime {
                details: format!("failed to spawn maintenance thread: {e}"),
            })?;
        Ok(MaintenanceHandle {
            stop: stop_tx,
            join: Some(join),
        })
    }
}

pub struct MaintenanceHandle {
    stop: Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl MaintenanceHandle {
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                tracing::error!("maintenance thread panicked");
            }
        }
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
