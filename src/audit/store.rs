//! SQLite audit tables and the drill-down queries behind the audit API.
//!
//! Sort keys arriving from clients are mapped through fixed whitelists; only
//! the mapped SQL fragment is ever interpolated into a statement.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde_json::{Map, Value};

use crate::audit::types::{
    AlertDetailRow, AlertSummaryRow, AuditedRule, GridPage, PageRequest, ProgressRow,
    ProgressSummaryRow,
};
use crate::audit::{AuditEntry, AuditSink};
use crate::core::errors::Result;
use crate::store::sqlite::open_connection;

/// Default number of rows for list endpoints without paging.
pub const DEFAULT_LIST_LIMIT: u32 = 50;

pub struct SqliteAuditStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn json_text<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

fn parse_json(text: Option<String>) -> Value {
    text.and_then(|t| serde_json::from_str(&t).ok())
        .unwrap_or(Value::Null)
}

fn sql_limit(limit: u32) -> i64 {
    i64::from(limit)
}

fn sql_offset(request: &PageRequest) -> i64 {
    i64::try_from(request.offset()).unwrap_or(i64::MAX)
}

/// `WHERE a AND b` or an empty string.
fn where_clause(conditions: &[&str]) -> String {
    if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    }
}

fn like_pattern(fragment: &str) -> SqlValue {
    SqlValue::Text(format!("%{fragment}%"))
}

const PROGRESS_COLUMNS: &str = "id, imei, rule_id, rule_name, components_executed, step_number, \
     stage_reached, level, is_post, stop_reason, buffer_size, metrics_ready, geofence_eval, \
     context_snapshot, execution_time";

fn progress_row(row: &Row<'_>) -> rusqlite::Result<ProgressRow> {
    let components: Option<String> = row.get(4)?;
    Ok(ProgressRow {
        id: row.get(0)?,
        imei: row.get(1)?,
        rule_id: row.get(2)?,
        rule_name: row.get(3)?,
        components_executed: components
            .and_then(|t| serde_json::from_str(&t).ok())
            .unwrap_or_default(),
        step_number: row.get(5)?,
        stage_reached: row.get(6)?,
        level: row.get(7)?,
        is_post: row.get(8)?,
        stop_reason: row.get(9)?,
        buffer_size: row.get(10)?,
        metrics_ready: row.get(11)?,
        geofence_eval: row.get(12)?,
        snapshot: parse_json(row.get(13)?),
        execution_time: row.get(14)?,
    })
}

fn alert_summary_row(row: &Row<'_>) -> rusqlite::Result<AlertSummaryRow> {
    Ok(AlertSummaryRow {
        imei: row.get(0)?,
        last_alert_date: row.get(1)?,
        total_alerts_24h: row.get(2)?,
        alert_types: parse_json(row.get(3)?),
        last_rule_executed: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        last_alert_location: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
    })
}

impl SqliteAuditStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_connection(path)?;
        apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ──────────────────── progress queries ────────────────────

    /// Newest progress rows, optionally for one device.
    pub fn recent_progress(&self, imei: Option<&str>, limit: u32) -> Result<Vec<ProgressRow>> {
        let conn = self.conn.lock();
        let rows = if let Some(imei) = imei {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {PROGRESS_COLUMNS} FROM rule_execution_state
                 WHERE imei = ?1 ORDER BY id DESC LIMIT ?2"
            ))?;
            stmt.query_map(params![imei, sql_limit(limit)], progress_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {PROGRESS_COLUMNS} FROM rule_execution_state ORDER BY id DESC LIMIT ?1"
            ))?;
            stmt.query_map(params![sql_limit(limit)], progress_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        Ok(rows)
    }

    /// One row per (device, rule) with step and frame counts.
    pub fn progress_summary(
        &self,
        request: &PageRequest,
        rule_name: Option<&str>,
        imei_search: Option<&str>,
    ) -> Result<GridPage<ProgressSummaryRow>> {
        let sort_expr = match request.sort_by.as_str() {
            "max_step" => "MAX(step_number)",
            "total_frames" => "COUNT(*)",
            "imei" => "imei",
            "rule_name" => "rule_name",
            _ => "MAX(execution_time)",
        };

        let mut conditions = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();
        if let Some(rule) = rule_name.filter(|r| !r.is_empty()) {
            conditions.push("rule_name = ?");
            args.push(SqlValue::Text(rule.to_string()));
        }
        if let Some(imei) = imei_search.filter(|i| !i.is_empty()) {
            conditions.push("imei LIKE ?");
            args.push(like_pattern(imei));
        }
        let filter = where_clause(&conditions);

        let conn = self.conn.lock();
        let records: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM (SELECT 1 FROM rule_execution_state {filter} GROUP BY imei, rule_name)"
            ),
            params_from_iter(args.iter()),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT imei, rule_name, MAX(step_number), COUNT(*), MAX(execution_time)
             FROM rule_execution_state {filter}
             GROUP BY imei, rule_name
             ORDER BY {sort_expr} {order}
             LIMIT ? OFFSET ?",
            order = request.order.as_sql(),
        );
        args.push(SqlValue::Integer(sql_limit(request.rows)));
        args.push(SqlValue::Integer(sql_offset(request)));
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                Ok(ProgressSummaryRow {
                    imei: row.get(0)?,
                    rule_name: row.get(1)?,
                    max_step: row.get(2)?,
                    total_frames: row.get(3)?,
                    last_frame_time: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(GridPage::new(request, u64::try_from(records).unwrap_or(0), rows))
    }

    /// Every progress row for one device.
    pub fn timeline(
        &self,
        imei: &str,
        request: &PageRequest,
        rule_name: Option<&str>,
    ) -> Result<GridPage<ProgressRow>> {
        let sort_column = match request.sort_by.as_str() {
            "id" => "id",
            "step_number" => "step_number",
            "rule_name" => "rule_name",
            "stage_reached" => "stage_reached",
            _ => "execution_time",
        };

        let mut conditions = vec!["imei = ?"];
        let mut args = vec![SqlValue::Text(imei.to_string())];
        if let Some(rule) = rule_name.filter(|r| !r.is_empty()) {
            conditions.push("rule_name = ?");
            args.push(SqlValue::Text(rule.to_string()));
        }
        let filter = where_clause(&conditions);

        let conn = self.conn.lock();
        let records: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM rule_execution_state {filter}"),
            params_from_iter(args.iter()),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {PROGRESS_COLUMNS} FROM rule_execution_state {filter}
             ORDER BY {sort_column} {order}, id {order}
             LIMIT ? OFFSET ?",
            order = request.order.as_sql(),
        );
        args.push(SqlValue::Integer(sql_limit(request.rows)));
        args.push(SqlValue::Integer(sql_offset(request)));
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), progress_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(GridPage::new(request, u64::try_from(records).unwrap_or(0), rows))
    }

    /// Stored snapshot for one progress row, `None` when the id is unknown.
    pub fn snapshot_by_id(&self, id: i64) -> Result<Option<Value>> {
        let conn = self.conn.lock();
        let text: Option<Option<String>> = conn
            .query_row(
                "SELECT context_snapshot FROM rule_execution_state WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(text.map(parse_json))
    }

    /// Rule names present in progress audit, most recently executed first.
    pub fn available_rules(&self) -> Result<Vec<AuditedRule>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT rule_name, COUNT(*), COUNT(DISTINCT imei), MAX(execution_time)
             FROM rule_execution_state
             GROUP BY rule_name
             ORDER BY MAX(execution_time) DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(AuditedRule {
                    rule_name: row.get(0)?,
                    total_frames: row.get(1)?,
                    total_imeis: row.get(2)?,
                    last_execution: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn progress_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM rule_execution_state", [], |row| row.get(0))?)
    }

    // ──────────────────── alert queries ────────────────────

    /// Paged per-device alert rollup. `search` matches device id or last rule.
    pub fn alert_grid(
        &self,
        request: &PageRequest,
        search: Option<&str>,
    ) -> Result<GridPage<AlertSummaryRow>> {
        let sort_column = match request.sort_by.as_str() {
            "imei" => "imei",
            "total_alerts_24h" => "total_alerts_24h",
            "last_rule_executed" => "last_rule_executed",
            _ => "last_alert_date",
        };
        let mut args: Vec<SqlValue> = Vec::new();
        let filter = match search.filter(|s| !s.is_empty()) {
            Some(text) => {
                args.push(like_pattern(text));
                args.push(like_pattern(text));
                "WHERE imei LIKE ? OR last_rule_executed LIKE ?"
            }
            None => "",
        };

        let conn = self.conn.lock();
        let records: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM alert_summary {filter}"),
            params_from_iter(args.iter()),
            |row| row.get(0),
        )?;
        let sql = format!(
            "SELECT imei, last_alert_date, total_alerts_24h, alert_types,
                    last_rule_executed, last_alert_location
             FROM alert_summary {filter}
             ORDER BY {sort_column} {order}
             LIMIT ? OFFSET ?",
            order = request.order.as_sql(),
        );
        args.push(SqlValue::Integer(sql_limit(request.rows)));
        args.push(SqlValue::Integer(sql_offset(request)));
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), alert_summary_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(GridPage::new(request, u64::try_from(records).unwrap_or(0), rows))
    }

    /// Most recently alerted devices.
    pub fn alert_summaries(&self, limit: u32) -> Result<Vec<AlertSummaryRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT imei, last_alert_date, total_alerts_24h, alert_types,
                    last_rule_executed, last_alert_location
             FROM alert_summary ORDER BY last_alert_date DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![sql_limit(limit)], alert_summary_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Fired alerts for one device, newest first.
    pub fn alert_details(&self, imei: &str, limit: u32) -> Result<Vec<AlertDetailRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, imei, alert_date, rule_name, rule_description, salience,
                    conditions_snapshot, actions_executed, telegram_sent,
                    latitude, longitude, speed
             FROM alert_details WHERE imei = ?1
             ORDER BY alert_date DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![imei, sql_limit(limit)], |row| {
                Ok(AlertDetailRow {
                    id: row.get(0)?,
                    imei: row.get(1)?,
                    alert_date: row.get(2)?,
                    rule_name: row.get(3)?,
                    rule_description: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                    salience: row.get::<_, Option<i64>>(5)?.unwrap_or_default(),
                    conditions: parse_json(row.get(6)?),
                    actions: parse_json(row.get(7)?),
                    telegram_sent: row.get(8)?,
                    latitude: row.get::<_, Option<f64>>(9)?.unwrap_or_default(),
                    longitude: row.get::<_, Option<f64>>(10)?.unwrap_or_default(),
                    speed: row.get::<_, Option<i64>>(11)?.unwrap_or_default(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

impl AuditSink for SqliteAuditStore {
    fn save_progress(&self, entry: &AuditEntry) -> Result<i64> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO rule_execution_state
                (imei, rule_id, rule_name, components_executed, step_number, stage_reached,
                 level, is_post, stop_reason, buffer_size, metrics_ready, geofence_eval,
                 context_snapshot, execution_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )?;
        stmt.execute(params![
            entry.imei,
            entry.rule_id,
            entry.rule_name,
            json_text(&entry.components_executed),
            entry.step_number,
            entry.stage_reached,
            entry.level,
            entry.is_post,
            entry.stop_reason,
            i64::try_from(entry.buffer_size).unwrap_or(i64::MAX),
            entry.metrics_ready,
            entry.geofence_eval,
            json_text(&entry.snapshot),
            ts(entry.execution_time),
        ])?;
        Ok(conn.last_insert_rowid())
    }

    fn save_alert(&self, entry: &AuditEntry) -> Result<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO alert_details
                (imei, alert_date, rule_name, rule_description, salience, conditions_snapshot,
                 actions_executed, telegram_sent, latitude, longitude, speed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entry.imei,
                ts(entry.execution_time),
                entry.rule_name,
                entry.description,
                entry.salience,
                json_text(&entry.snapshot),
                json_text(&entry.components_executed),
                entry.telegram_sent(),
                entry.latitude,
                entry.longitude,
                entry.speed,
            ],
        )?;
        let id = tx.last_insert_rowid();

        let cutoff = ts(entry.execution_time - TimeDelta::hours(24));
        let mut alert_types = Map::new();
        let mut total = 0_i64;
        {
            let mut stmt = tx.prepare_cached(
                "SELECT rule_name, COUNT(*) FROM alert_details
                 WHERE imei = ?1 AND alert_date >= ?2
                 GROUP BY rule_name",
            )?;
            let counts = stmt
                .query_map(params![entry.imei, cutoff], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for (rule, count) in counts {
                total += count;
                alert_types.insert(rule, Value::from(count));
            }
        }

        tx.execute(
            "INSERT INTO alert_summary
                (imei, last_alert_date, total_alerts_24h, alert_types, last_rule_executed,
                 last_alert_location, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(imei) DO UPDATE SET
                last_alert_date = excluded.last_alert_date,
                total_alerts_24h = excluded.total_alerts_24h,
                alert_types = excluded.alert_types,
                last_rule_executed = excluded.last_rule_executed,
                last_alert_location = excluded.last_alert_location,
                updated_at = excluded.updated_at",
            params![
                entry.imei,
                ts(entry.execution_time),
                total,
                Value::Object(alert_types).to_string(),
                entry.rule_name,
                format!("{:.6},{:.6}", entry.latitude, entry.longitude),
                ts(Utc::now()),
            ],
        )?;
        tx.commit()?;
        Ok(id)
    }

    fn clear_progress(&self) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM rule_execution_state", [])?)
    }

    fn prune_progress_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute(
            "DELETE FROM rule_execution_state WHERE execution_time < ?1",
            params![ts(cutoff)],
        )?)
    }
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS rule_execution_state (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            imei TEXT NOT NULL,
            rule_id INTEGER NOT NULL DEFAULT 0,
            rule_name TEXT NOT NULL,
            components_executed TEXT,
            step_number INTEGER NOT NULL DEFAULT 0,
            stage_reached TEXT NOT NULL,
            level TEXT NOT NULL DEFAULT 'info',
            is_post INTEGER NOT NULL DEFAULT 1,
            stop_reason TEXT NOT NULL,
            buffer_size INTEGER NOT NULL DEFAULT 0,
            metrics_ready INTEGER NOT NULL DEFAULT 0,
            geofence_eval TEXT NOT NULL DEFAULT 'not_evaluated',
            context_snapshot TEXT,
            execution_time TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_res_imei_time ON rule_execution_state (imei, execution_time);
        CREATE INDEX IF NOT EXISTS idx_res_rule_stage ON rule_execution_state (rule_name, stage_reached);
        CREATE INDEX IF NOT EXISTS idx_res_time ON rule_execution_state (execution_time);

        CREATE TABLE IF NOT EXISTS alert_details (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            imei TEXT NOT NULL,
            alert_date TEXT NOT NULL,
            rule_name TEXT NOT NULL,
            rule_description TEXT,
            salience INTEGER,
            conditions_snapshot TEXT,
            actions_executed TEXT,
            telegram_sent INTEGER NOT NULL DEFAULT 0,
            latitude REAL,
            longitude REAL,
            speed INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_ad_imei_date ON alert_details (imei, alert_date);
        CREATE INDEX IF NOT EXISTS idx_ad_rule ON alert_details (rule_name);

        CREATE TABLE IF NOT EXISTS alert_summary (
            imei TEXT PRIMARY KEY,
            last_alert_date TEXT NOT NULL,
            total_alerts_24h INTEGER NOT NULL DEFAULT 0,
            alert_types TEXT,
            last_rule_executed TEXT,
            last_alert_location TEXT,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_as_last_alert ON alert_summary (last_alert_date);",
    )?;
    Ok(())
}
