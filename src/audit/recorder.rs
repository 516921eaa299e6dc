//! Runtime progress toggle and the worker hook that feeds it.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::Utc;

use crate::audit::snapshot::{extract_snapshot, filter_snapshot};
use crate::audit::types::GEOFENCE_NOT_EVALUATED;
use crate::audit::{AuditEntry, AuditSink, ProgressStatus, RuleMeta};
use crate::core::errors::Result;
use crate::engine::context::{EvaluationContext, ExecutionTrace};
use crate::engine::worker::{ExecutionListener, RuleInvocation, RuleOutcome};

/// Owns the progress switch and routes entries to the sink.
pub struct AuditRecorder {
    sink: Arc<dyn AuditSink>,
    progress_enabled: AtomicBool,
    captured: AtomicU64,
    alerts_captured: AtomicU64,
    failures: AtomicU64,
}

impl AuditRecorder {
    pub fn new(sink: Arc<dyn AuditSink>, progress_enabled: bool) -> Self {
        Self {
            sink,
            progress_enabled: AtomicBool::new(progress_enabled),
            captured: AtomicU64::new(0),
            alerts_captured: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn enable(&self) {
        if !self.progress_enabled.swap(true, Ordering::SeqCst) {
            tracing::info!("progress audit enabled");
        }
    }

    pub fn disable(&self) {
        if self.progress_enabled.swap(false, Ordering::SeqCst) {
            tracing::info!("progress audit disabled");
        }
    }

    pub fn is_progress_enabled(&self) -> bool {
        self.progress_enabled.load(Ordering::SeqCst)
    }

    /// Delete every progress row. The switch is left as it was.
    pub fn clear(&self) -> Result<usize> {
        let removed = self.sink.clear_progress()?;
        tracing::info!(removed, "progress audit cleared");
        Ok(removed)
    }

    pub fn status(&self) -> ProgressStatus {
        ProgressStatus {
            enabled: self.is_progress_enabled(),
            captured: self.captured.load(Ordering::Relaxed),
            alerts_captured: self.alerts_captured.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    pub fn sink(&self) -> &Arc<dyn AuditSink> {
        &self.sink
    }

    /// Progress row when capture is on; alert row whenever the alert fired.
    pub fn capture(&self, entry: &AuditEntry) {
        if self.is_progress_enabled() {
            match self.sink.save_progress(entry) {
                Ok(id) => {
                    self.captured.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(id, imei = %entry.imei, rule = %entry.rule_name, post = entry.is_post, "progress captured");
                }
                Err(error) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(imei = %entry.imei, rule = %entry.rule_name, %error, "progress audit write failed");
                }
            }
        }

        if entry.alert_fired {
            match self.sink.save_alert(entry) {
                Ok(id) => {
                    self.alerts_captured.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(id, imei = %entry.imei, rule = %entry.rule_name, "alert recorded");
                }
                Err(error) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(imei = %entry.imei, rule = %entry.rule_name, %error, "alert audit write failed");
                }
            }
        }
    }
}

// ──────────────────── worker hook ────────────────────

/// Captures pre/post snapshots for rules whose manifest entry is enabled.
pub struct AuditListener {
    recorder: Arc<AuditRecorder>,
}

impl AuditListener {
    pub fn new(recorder: Arc<AuditRecorder>) -> Self {
        Self { recorder }
    }

    fn entry(
        invocation: &RuleInvocation<'_>,
        meta: &RuleMeta,
        ctx: &EvaluationContext,
        trace: Option<&ExecutionTrace>,
    ) -> AuditEntry {
        let packet = ctx.packet();
        let snapshot = filter_snapshot(extract_snapshot(ctx, &packet.imei, None), &meta.snapshot);
        let stage_reached = trace
            .and_then(|t| t.stage.clone())
            .unwrap_or_else(|| {
                if meta.description.is_empty() {
                    "completed".to_string()
                } else {
                    meta.description.clone()
                }
            });
        AuditEntry {
            imei: packet.imei.clone(),
            rule_id: invocation.rule.id,
            rule_name: invocation.rule.name.clone(),
            description: meta.description.clone(),
            level: meta.level.clone(),
            salience: invocation.rule.priority,
            step_number: meta.order,
            snapshot,
            stage_reached,
            stop_reason: trace
                .and_then(|t| t.stop_reason.clone())
                .unwrap_or_else(|| "completed".to_string()),
            alert_fired: meta.is_alert && trace.is_some_and(|t| !t.alerts_won.is_empty()),
            is_post: trace.is_some(),
            components_executed: trace.map(|t| t.components.clone()).unwrap_or_default(),
            buffer_size: ctx.state().buffer_len(),
            metrics_ready: ctx.flags().metrics_ready,
            geofence_eval: trace
                .and_then(|t| t.geofence_eval.clone())
                .unwrap_or_else(|| GEOFENCE_NOT_EVALUATED.to_string()),
            latitude: packet.latitude,
            longitude: packet.longitude,
            speed: packet.speed,
            execution_time: Utc::now(),
        }
    }
}

impl ExecutionListener for AuditListener {
    fn before_rule(&self, invocation: &RuleInvocation<'_>, ctx: &EvaluationContext) {
        if !self.recorder.is_progress_enabled() {
            return;
        }
        let Some(meta) = invocation.meta.filter(|m| m.enabled) else {
            return;
        };
        let mut entry = Self::entry(invocation, meta, ctx, None);
        entry.stage_reached = "started".to_string();
        entry.stop_reason = "pending".to_string();
        self.recorder.capture(&entry);
    }

    fn after_rule(
        &self,
        invocation: &RuleInvocation<'_>,
        ctx: &EvaluationContext,
        trace: &ExecutionTrace,
        outcome: &RuleOutcome,
    ) {
        if !matches!(outcome, RuleOutcome::Completed) {
            return;
        }
        let Some(meta) = invocation.meta else {
            tracing::trace!(rule = %invocation.rule.name, "no manifest entry, post snapshot skipped");
            return;
        };
        if !meta.enabled {
            return;
        }
        self.recorder
            .capture(&Self::entry(invocation, meta, ctx, Some(trace)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::core::errors::FreError;

    struct FailingSink;

    impl AuditSink for FailingSink {
        fn save_progress(&self, _entry: &AuditEntry) -> Result<i64> {
            Err(FreError::Sql {
                context: "test",
                details: "disk I/O error".to_string(),
            })
        }

        fn save_alert(&self, entry: &AuditEntry) -> Result<i64> {
            self.save_progress(entry)
        }

        fn clear_progress(&self) -> Result<usize> {
            Ok(0)
        }

        fn prune_progress_before(&self, _cutoff: chrono::DateTime<Utc>) -> Result<usize> {
            Ok(0)
        }
    }

    fn recorder(progress: bool) -> (Arc<MemoryAuditSink>, AuditRecorder) {
        let sink = Arc::new(MemoryAuditSink::new());
        let recorder = AuditRecorder::new(sink.clone(), progress);
        (sink, recorder)
    }

    #[test]
    fn toggle_controls_progress_rows_only() {
        let (sink, recorder) = recorder(false);
        let mut entry = AuditEntry::new("1", "jammer");

        recorder.capture(&entry);
        assert!(sink.progress().is_empty());

        recorder.enable();
        recorder.capture(&entry);
        assert_eq!(sink.progress().len(), 1);

        recorder.disable();
        entry.alert_fired = true;
        recorder.capture(&entry);
        assert_eq!(sink.progress().len(), 1);
        assert_eq!(sink.alerts().len(), 1);

        let status = recorder.status();
        assert!(!status.enabled);
        assert_eq!(status.captured, 1);
        assert_eq!(status.alerts_captured, 1);
    }

    #[test]
    fn clear_keeps_switch_state() {
        let (sink, recorder) = recorder(true);
        recorder.capture(&AuditEntry::new("1", "a"));
        recorder.capture(&AuditEntry::new("1", "b"));
        assert_eq!(recorder.clear().unwrap(), 2);
        assert!(sink.progress().is_empty());
        assert!(recorder.is_progress_enabled());
    }

    #[test]
    fn sink_failures_are_counted_not_raised() {
        let recorder = AuditRecorder::new(Arc::new(FailingSink), true);
        let mut entry = AuditEntry::new("1", "jammer");
        entry.alert_fired = true;
        recorder.capture(&entry);
        assert_eq!(recorder.status().failures, 2);
        assert_eq!(recorder.status().captured, 0);
    }
}
