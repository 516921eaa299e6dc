//! SQLite store: WAL-mode database for device state, geofences, rules and the
//! durable alert guard.
//!
//! One connection behind a mutex; the guard relies on the primary key of
//! `alert_guard` so concurrent processes sharing the file still see exactly one
//! winner per (device, rule).

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};

use crate::core::errors::{FreError, Result};
use crate::store::{
    AlertGuardStore, GeofenceShape, GeofenceStore, RuleDefinition, RuleSource, ShapeKind,
    StateStore,
};

/// Relational store backing every persistence contract.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the database at `path`, applying schema and PRAGMAs.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = open_connection(path)?;
        apply_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    /// Path to the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ──────────────────── geofences ────────────────────

    /// Persist a shape and attach it to `group`, creating the group on demand.
    pub fn add_geofence(&self, group: &str, name: &str, kind: &ShapeKind) -> Result<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO geofence_groups (name) VALUES (?1)",
            params![group],
        )?;
        let group_id: i64 = tx.query_row(
            "SELECT id FROM geofence_groups WHERE name = ?1",
            params![group],
            |row| row.get(0),
        )?;
        let (center_lat, center_lon, radius_m, min_lat, max_lat, min_lon, max_lon) = match *kind {
            ShapeKind::Circle {
                center_lat,
                center_lon,
                radius_m,
            } => (
                Some(center_lat),
                Some(center_lon),
                Some(radius_m),
                None,
                None,
                None,
                None,
            ),
            ShapeKind::BoundingBox {
                min_lat,
                max_lat,
                min_lon,
                max_lon,
            } => (
                None,
                None,
                None,
                Some(min_lat),
                Some(max_lat),
                Some(min_lon),
                Some(max_lon),
            ),
        };
        tx.execute(
            "INSERT INTO geofences (
                name, shape_type, center_lat, center_lon, radius_m,
                min_lat, max_lat, min_lon, max_lon
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                name,
                kind.label(),
                center_lat,
                center_lon,
                radius_m,
                min_lat,
                max_lat,
                min_lon,
                max_lon
            ],
        )?;
        let geofence_id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO geofence_group_members (group_id, geofence_id) VALUES (?1, ?2)",
            params![group_id, geofence_id],
        )?;
        tx.commit()?;
        Ok(geofence_id)
    }

    // ──────────────────── rules ────────────────────

    /// Insert a rule or replace the one with the same name. Returns its id.
    pub fn upsert_rule(&self, rule: &RuleDefinition) -> Result<i64> {
        let now = now_rfc3339();
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO fleet_rules (
                name, description, script, audit_manifest, active, priority,
                created_at, updated_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?7)
            ON CONFLICT(name) DO UPDATE SET
                description = excluded.description,
                script = excluded.script,
                audit_manifest = excluded.audit_manifest,
                active = excluded.active,
                priority = excluded.priority,
                updated_at = excluded.updated_at",
        )?
        .execute(params![
            rule.name,
            rule.description,
            rule.script,
            rule.audit_manifest,
            rule.active,
            rule.priority,
            now,
        ])?;
        let id = conn.query_row(
            "SELECT id FROM fleet_rules WHERE name = ?1",
            params![rule.name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Flip a rule's active flag. Errors when the rule does not exist.
    pub fn set_rule_active(&self, name: &str, active: bool) -> Result<()> {
        let changed = self.conn.lock().execute(
            "UPDATE fleet_rules SET active = ?2, updated_at = ?3 WHERE name = ?1",
            params![name, active, now_rfc3339()],
        )?;
        if changed == 0 {
            return Err(FreError::NotFound {
                entity: "rule",
                key: name.to_string(),
            });
        }
        Ok(())
    }

    fn query_rules(&self, only_active: bool) -> Result<Vec<RuleDefinition>> {
        let conn = self.conn.lock();
        let sql = if only_active {
            "SELECT id, name, description, script, audit_manifest, active, priority
             FROM fleet_rules WHERE active = 1 ORDER BY priority DESC, id ASC"
        } else {
            "SELECT id, name, description, script, audit_manifest, active, priority
             FROM fleet_rules ORDER BY priority DESC, id ASC"
        };
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RuleDefinition {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                    script: row.get(3)?,
                    audit_manifest: row.get(4)?,
                    active: row.get(5)?,
                    priority: row.get(6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn upsert_state(
        &self,
        imei: &str,
        key: &str,
        text: Option<&str>,
        int: Option<i64>,
        time: Option<String>,
    ) -> Result<()> {
        self.conn
            .lock()
            .prepare_cached(
                "INSERT INTO vehicle_rule_state (
                    imei, key_name, value_text, value_int, value_time, updated_at
                ) VALUES (?1,?2,?3,?4,?5,?6)
                ON CONFLICT(imei, key_name) DO UPDATE SET
                    value_text = excluded.value_text,
                    value_int = excluded.value_int,
                    value_time = excluded.value_time,
                    updated_at = excluded.updated_at",
            )?
            .execute(params![imei, key, text, int, time, now_rfc3339()])?;
        Ok(())
    }
}

impl StateStore for SqliteStore {
    fn get_string(&self, imei: &str, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value: Option<Option<String>> = conn
            .prepare_cached(
                "SELECT value_text FROM vehicle_rule_state WHERE imei = ?1 AND key_name = ?2",
            )?
            .query_row(params![imei, key], |row| row.get(0))
            .optional()?;
        Ok(value.flatten())
    }

    fn set_string(&self, imei: &str, key: &str, value: &str) -> Result<()> {
        self.upsert_state(imei, key, Some(value), None, None)
    }

    fn get_i64(&self, imei: &str, key: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let value: Option<Option<i64>> = conn
            .prepare_cached(
                "SELECT value_int FROM vehicle_rule_state WHERE imei = ?1 AND key_name = ?2",
            )?
            .query_row(params![imei, key], |row| row.get(0))
            .optional()?;
        Ok(value.flatten())
    }

    fn set_i64(&self, imei: &str, key: &str, value: i64) -> Result<()> {
        self.upsert_state(imei, key, None, Some(value), None)
    }

    fn get_time(&self, imei: &str, key: &str) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<Option<String>> = {
            let conn = self.conn.lock();
            conn.prepare_cached(
                "SELECT value_time FROM vehicle_rule_state WHERE imei = ?1 AND key_name = ?2",
            )?
            .query_row(params![imei, key], |row| row.get(0))
            .optional()?
        };
        raw.flatten()
            .map(|text| {
                DateTime::parse_from_rfc3339(&text)
                    .map(|ts| ts.with_timezone(&Utc))
                    .map_err(|error| FreError::Serialization {
                        context: "vehicle_rule_state.value_time",
                        details: format!("{text:?}: {error}"),
                    })
            })
            .transpose()
    }

    fn set_time(&self, imei: &str, key: &str, value: DateTime<Utc>) -> Result<()> {
        self.upsert_state(
            imei,
            key,
            None,
            None,
            Some(value.to_rfc3339_opts(SecondsFormat::Millis, true)),
        )
    }
}

impl GeofenceStore for SqliteStore {
    fn geofences_by_group(&self, group: &str) -> Result<Vec<GeofenceShape>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT g.id, g.name, g.shape_type, g.center_lat, g.center_lon, g.radius_m,
                    g.min_lat, g.max_lat, g.min_lon, g.max_lon
             FROM geofences g
             JOIN geofence_group_members m ON m.geofence_id = g.id
             JOIN geofence_groups gg ON gg.id = m.group_id
             WHERE gg.name = ?1
             ORDER BY g.id",
        )?;
        let rows = stmt
            .query_map(params![group], |row| {
                Ok(ShapeRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    shape_type: row.get(2)?,
                    center_lat: row.get(3)?,
                    center_lon: row.get(4)?,
                    radius_m: row.get(5)?,
                    min_lat: row.get(6)?,
                    max_lat: row.get(7)?,
                    min_lon: row.get(8)?,
                    max_lon: row.get(9)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().filter_map(ShapeRow::into_shape).collect())
    }
}

impl AlertGuardStore for SqliteStore {
    fn is_alert_sent(&self, imei: &str, rule: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .prepare_cached("SELECT 1 FROM alert_guard WHERE imei = ?1 AND rule_name = ?2")?
            .query_row(params![imei, rule], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    fn try_mark_alert_sent(&self, imei: &str, rule: &str) -> Result<bool> {
        let inserted = self
            .conn
            .lock()
            .prepare_cached(
                "INSERT OR IGNORE INTO alert_guard (imei, rule_name, marked_at) VALUES (?1,?2,?3)",
            )?
            .execute(params![imei, rule, now_rfc3339()])?;
        Ok(inserted == 1)
    }
}

impl RuleSource for SqliteStore {
    fn load_active_rules(&self) -> Result<Vec<RuleDefinition>> {
        self.query_rules(true)
    }

    fn list_rules(&self) -> Result<Vec<RuleDefinition>> {
        self.query_rules(false)
    }
}

// ──────────────────── row types ────────────────────

struct ShapeRow {
    id: i64,
    name: String,
    shape_type: String,
    center_lat: Option<f64>,
    center_lon: Option<f64>,
    radius_m: Option<f64>,
    min_lat: Option<f64>,
    max_lat: Option<f64>,
    min_lon: Option<f64>,
    max_lon: Option<f64>,
}

impl ShapeRow {
    /// Incomplete or unknown shapes are skipped, which keeps them "outside".
    fn into_shape(self) -> Option<GeofenceShape> {
        let kind = match self.shape_type.to_ascii_lowercase().as_str() {
            "circle" => match (self.center_lat, self.center_lon, self.radius_m) {
                (Some(center_lat), Some(center_lon), Some(radius_m)) => ShapeKind::Circle {
                    center_lat,
                    center_lon,
                    radius_m,
                },
                _ => {
                    tracing::warn!(id = self.id, name = %self.name, "circle geofence missing center or radius");
                    return None;
                }
            },
            "polygon" | "bbox" | "bounding_box" => {
                match (self.min_lat, self.max_lat, self.min_lon, self.max_lon) {
                    (Some(min_lat), Some(max_lat), Some(min_lon), Some(max_lon)) => {
                        ShapeKind::BoundingBox {
                            min_lat,
                            max_lat,
                            min_lon,
                            max_lon,
                        }
                    }
                    _ => {
                        tracing::warn!(id = self.id, name = %self.name, "bounding box geofence missing corners");
                        return None;
                    }
                }
            }
            other => {
                tracing::warn!(id = self.id, shape_type = other, "unknown geofence shape type");
                return None;
            }
        };
        Some(GeofenceShape {
            id: self.id,
            name: self.name,
            kind,
        })
    }
}

// ──────────────────── schema & pragmas ────────────────────

/// Open a read-write connection with the shared PRAGMA set.
pub(crate) fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| FreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    apply_pragmas(&conn)?;
    Ok(conn)
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA temp_store = MEMORY;
         PRAGMA busy_timeout = 5000;",
    )?;
    let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        tracing::warn!(mode = %mode, "requested WAL journal mode but sqlite refused");
    }
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS vehicle_rule_state (
            imei TEXT NOT NULL,
            key_name TEXT NOT NULL,
            value_text TEXT,
            value_int INTEGER,
            value_time TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (imei, key_name)
        );

        CREATE TABLE IF NOT EXISTS geofence_groups (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS geofences (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            shape_type TEXT NOT NULL,
            center_lat REAL,
            center_lon REAL,
            radius_m REAL,
            min_lat REAL,
            max_lat REAL,
            min_lon REAL,
            max_lon REAL
        );

        CREATE TABLE IF NOT EXISTS geofence_group_members (
            group_id INTEGER NOT NULL REFERENCES geofence_groups(id),
            geofence_id INTEGER NOT NULL REFERENCES geofences(id),
            PRIMARY KEY (group_id, geofence_id)
        );

        CREATE TABLE IF NOT EXISTS fleet_rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT '',
            script TEXT NOT NULL,
            audit_manifest TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            priority INTEGER NOT NULL DEFAULT 100,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS alert_guard (
            imei TEXT NOT NULL,
            rule_name TEXT NOT NULL,
            marked_at TEXT NOT NULL,
            PRIMARY KEY (imei, rule_name)
        );

        CREATE INDEX IF NOT EXISTS idx_fleet_rules_active ON fleet_rules(active, priority);",
    )?;
    Ok(())
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ──────────────────── tests ────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn temp_db() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("state.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn state_round_trips_each_kind() {
        let (_dir, store) = temp_db();
        let ts = DateTime::parse_from_rfc3339("2026-03-01T12:30:00.250Z")
            .unwrap()
            .with_timezone(&Utc);

        store.set_string("123", "note", "hello").unwrap();
        store.set_i64("123", "count", 42).unwrap();
        store.set_time("123", "last_valid", ts).unwrap();

        assert_eq!(store.get_string("123", "note").unwrap().as_deref(), Some("hello"));
        assert_eq!(store.get_i64("123", "count").unwrap(), Some(42));
        assert_eq!(store.get_time("123", "last_valid").unwrap(), Some(ts));
        assert_eq!(store.get_i64("456", "count").unwrap(), None);
    }

    #[test]
    fn overwrite_replaces_value() {
        let (_dir, store) = temp_db();
        store.set_i64("123", "count", 1).unwrap();
        store.set_i64("123", "count", 2).unwrap();
        assert_eq!(store.get_i64("123", "count").unwrap(), Some(2));
    }

    #[test]
    fn geofences_load_by_group() {
        let (_dir, store) = temp_db();
        store
            .add_geofence(
                "Taller",
                "main shop",
                &ShapeKind::Circle {
                    center_lat: 19.43,
                    center_lon: -99.13,
                    radius_m: 300.0,
                },
            )
            .unwrap();
        store
            .add_geofence(
                "Taller",
                "annex",
                &ShapeKind::BoundingBox {
                    min_lat: 19.0,
                    max_lat: 19.1,
                    min_lon: -99.3,
                    max_lon: -99.2,
                },
            )
            .unwrap();

        let shapes = store.geofences_by_group("Taller").unwrap();
        assert_eq!(shapes.len(), 2);
        assert_eq!(shapes[0].name, "main shop");
        assert!(matches!(shapes[1].kind, ShapeKind::BoundingBox { .. }));
        assert!(store.geofences_by_group("missing").unwrap().is_empty());
    }

    #[test]
    fn incomplete_shape_rows_are_skipped() {
        let (_dir, store) = temp_db();
        {
            let conn = store.conn.lock();
            conn.execute_batch(
                "INSERT INTO geofence_groups (name) VALUES ('Taller');
                 INSERT INTO geofences (name, shape_type, center_lat) VALUES ('broken', 'Circle', 1.0);
                 INSERT INTO geofence_group_members (group_id, geofence_id) VALUES (1, 1);",
            )
            .unwrap();
        }
        assert!(store.geofences_by_group("Taller").unwrap().is_empty());
    }

    #[test]
    fn rules_upsert_and_order() {
        let (_dir, store) = temp_db();
        store
            .upsert_rule(&RuleDefinition::new("low", "native:buffer_update").with_priority(1))
            .unwrap();
        let id = store
            .upsert_rule(&RuleDefinition::new("high", "native:jammer_detection").with_priority(900))
            .unwrap();
        let again = store
            .upsert_rule(
                &RuleDefinition::new("high", "native:jammer_detection")
                    .with_priority(900)
                    .with_description("updated"),
            )
            .unwrap();
        assert_eq!(id, again);

        let active = store.load_active_rules().unwrap();
        assert_eq!(active[0].name, "high");
        assert_eq!(active[0].description, "updated");

        store.set_rule_active("high", false).unwrap();
        assert_eq!(store.load_active_rules().unwrap().len(), 1);
        assert_eq!(store.list_rules().unwrap().len(), 2);
        assert!(matches!(
            store.set_rule_active("nope", true),
            Err(FreError::NotFound { .. })
        ));
    }

    #[test]
    fn concurrent_marks_have_single_winner() {
        let (_dir, store) = temp_db();
        let store = Arc::new(store);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.try_mark_alert_sent("123", "jammer").unwrap())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert!(store.is_alert_sent("123", "jammer").unwrap());
    }

    #[test]
    fn guard_shared_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let a = SqliteStore::open(&path).unwrap();
        let b = SqliteStore::open(&path).unwrap();
        assert!(a.try_mark_alert_sent("123", "offline").unwrap());
        assert!(!b.try_mark_alert_sent("123", "offline").unwrap());
        assert!(b.is_alert_sent("123", "offline").unwrap());
    }
}
