//! Audit records and the row shapes returned by audit queries.

#![allow(missing_docs)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capabilities::SnapshotData;

/// Default `geofence_eval` when the rule never tested a geofence.
pub const GEOFENCE_NOT_EVALUATED: &str = "not_evaluated";

/// One captured rule execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub imei: String,
    pub rule_id: i64,
    pub rule_name: String,
    pub description: String,
    pub level: String,
    pub salience: i64,
    pub step_number: i64,
    pub snapshot: SnapshotData,
    pub stage_reached: String,
    pub stop_reason: String,
    pub alert_fired: bool,
    pub is_post: bool,
    pub components_executed: Vec<String>,
    pub buffer_size: usize,
    pub metrics_ready: bool,
    pub geofence_eval: String,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: i64,
    pub execution_time: DateTime<Utc>,
}

impl AuditEntry {
    /// Minimal entry; callers fill in what they know.
    pub fn new(imei: impl Into<String>, rule_name: impl Into<String>) -> Self {
        Self {
            imei: imei.into(),
            rule_id: 0,
            rule_name: rule_name.into(),
            description: String::new(),
            level: "info".to_string(),
            salience: 0,
            step_number: 0,
            snapshot: SnapshotData::new(),
            stage_reached: String::new(),
            stop_reason: String::new(),
            alert_fired: false,
            is_post: true,
            components_executed: Vec::new(),
            buffer_size: 0,
            metrics_ready: false,
            geofence_eval: GEOFENCE_NOT_EVALUATED.to_string(),
            latitude: 0.0,
            longitude: 0.0,
            speed: 0,
            execution_time: Utc::now(),
        }
    }

    /// Whether the rule requested an outbound message.
    pub fn telegram_sent(&self) -> bool {
        self.components_executed.iter().any(|c| c == "send_telegram")
    }
}

// ──────────────────── query rows ────────────────────

/// One `rule_execution_state` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRow {
    pub id: i64,
    pub imei: String,
    pub rule_id: i64,
    pub rule_name: String,
    pub components_executed: Vec<String>,
    pub step_number: i64,
    pub stage_reached: String,
    pub level: String,
    pub is_post: bool,
    pub stop_reason: String,
    pub buffer_size: i64,
    pub metrics_ready: bool,
    pub geofence_eval: String,
    pub snapshot: Value,
    pub execution_time: String,
}

/// One (device, rule) group of progress rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSummaryRow {
    pub imei: String,
    pub rule_name: String,
    pub max_step: i64,
    pub total_frames: i64,
    pub last_frame_time: String,
}

/// Rule names seen in progress audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditedRule {
    pub rule_name: String,
    pub total_frames: i64,
    pub total_imeis: i64,
    pub last_execution: String,
}

/// Per-device alert rollup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertSummaryRow {
    pub imei: String,
    pub last_alert_date: String,
    pub total_alerts_24h: i64,
    pub alert_types: Value,
    pub last_rule_executed: String,
    pub last_alert_location: String,
}

/// One fired alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertDetailRow {
    pub id: i64,
    pub imei: String,
    pub alert_date: String,
    pub rule_name: String,
    pub rule_description: String,
    pub salience: i64,
    pub conditions: Value,
    pub actions: Value,
    pub telegram_sent: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub speed: i64,
}

/// Runtime state of progress capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressStatus {
    pub enabled: bool,
    pub captured: u64,
    pub alerts_captured: u64,
    pub failures: u64,
}

// ──────────────────── paging ────────────────────

/// Sort direction as sent by grid clients (`sord`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    /// Case-insensitive; anything unrecognized yields `default`.
    pub fn parse_or(raw: Option<&str>, default: Self) -> Self {
        match raw.map(str::trim) {
            Some(s) if s.eq_ignore_ascii_case("asc") => Self::Asc,
            Some(s) if s.eq_ignore_ascii_case("desc") => Self::Desc,
            _ => default,
        }
    }

    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Resolved paging request. `page` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub rows: u32,
    pub sort_by: String,
    pub order: SortOrder,
}

/// Upper bound on rows per page.
pub const MAX_PAGE_ROWS: u32 = 500;

impl PageRequest {
    pub fn new(page: Option<u32>, rows: Option<u32>, default_rows: u32) -> Self {
        Self {
            page: page.filter(|p| *p > 0).unwrap_or(1),
            rows: rows
                .filter(|r| *r > 0)
                .unwrap_or(default_rows)
                .min(MAX_PAGE_ROWS),
            sort_by: String::new(),
            order: SortOrder::Desc,
        }
    }

    #[must_use]
    pub fn sorted(mut self, sort_by: impl Into<String>, order: SortOrder) -> Self {
        self.sort_by = sort_by.into();
        self.order = order;
        self
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.rows)
    }
}

/// jqGrid-shaped page: `total` is the page count, `records` the row count.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridPage<T> {
    pub page: u32,
    pub total: u64,
    pub records: u64,
    pub rows: Vec<T>,
}

impl<T> GridPage<T> {
    pub fn new(request: &PageRequest, records: u64, rows: Vec<T>) -> Self {
        Self {
            page: request.page,
            total: records.div_ceil(u64::from(request.rows.max(1))),
            records,
            rows,
        }
    }
}
